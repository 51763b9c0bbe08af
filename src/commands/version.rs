use anyhow::Result;

pub fn run() -> Result<()> {
    println!("weft {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
