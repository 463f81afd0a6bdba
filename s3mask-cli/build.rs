use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Emit the cargo build metadata that goes into the long version string
    EmitBuilder::builder().all_cargo().emit()?;

    Ok(())
}
