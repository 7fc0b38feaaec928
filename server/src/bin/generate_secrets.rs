use base64::Engine as _;
use color_eyre::eyre::Result;
use rand::{rngs::OsRng, RngCore};

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn main() -> Result<()> {
    color_eyre::install()?;

    // 48 bytes for the HMAC secret, 64 for the cookie encryption/signing key
    let csrf_secret = random_base64(48);
    let cookie_key = random_base64(64);

    println!("Generated production secrets:");
    println!();
    println!("CSRF_SECRET=\"{}\"", csrf_secret);
    println!("COOKIE_KEY=\"{}\"", cookie_key);
    println!();
    println!("Both values are required when APP_ENV=production.");

    Ok(())
}
