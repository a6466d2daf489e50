//! secp256k1 operator key generator for agentpay-node.
//!
//! This utility generates a new operator key and outputs:
//! - The private key saved to a file (pass it to the node as `PRIVATE_KEY`)
//! - The operator address (fund it for gas, register it with the signer manager)
//!
//! Usage:
//!   cargo run --bin agentpay-keygen [output-dir]

use alloy::signers::local::PrivateKeySigner;
use color_eyre::eyre::WrapErr;
use std::env;
use std::fs;
use std::path::PathBuf;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    println!("Operator Key Generator for agentpay-node\n");

    // Get output directory from args or use current directory
    let output_dir = match env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir().wrap_err("Failed to get current directory")?,
    };

    // Create output directory if it doesn't exist
    fs::create_dir_all(&output_dir).wrap_err("Failed to create output directory")?;

    println!("Generating secp256k1 operator key...");
    let signer = PrivateKeySigner::random();
    let secret = hex::encode(signer.to_bytes());

    let key_path = output_dir.join("operator.key");
    if key_path.exists() {
        color_eyre::eyre::bail!("{} already exists; refusing to overwrite", key_path.display());
    }
    fs::write(&key_path, format!("0x{secret}\n")).wrap_err("Failed to write operator key")?;
    println!("\nPrivate key saved to: {}", key_path.display());
    println!("  WARNING: Keep this file secure! It signs every signer-manager call.");

    let address_path = output_dir.join("operator.address");
    fs::write(&address_path, format!("{}\n", signer.address()))
        .wrap_err("Failed to write operator address")?;

    println!("\nOperator address: {}", signer.address());
    println!(
        "Generated: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("\nDone! Start the node with PRIVATE_KEY=$(cat {})", key_path.display());
    Ok(())
}
