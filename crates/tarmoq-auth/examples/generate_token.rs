//! Generate a JWT for agent authentication
//!
//! Usage:
//!   cargo run --example generate_token -- --secret "your-secret-key" --identity alice

use chrono::Duration;
use clap::Parser;
use tarmoq_auth::{JwtAuthorizer, JwtClaims};

#[derive(Parser, Debug)]
#[command(name = "generate_token")]
#[command(about = "Generate a JWT for tarmoq agent authentication", long_about = None)]
struct Args {
    /// JWT secret (must match the broker's --jwt-secret)
    #[arg(long, env = "TARMOQ_JWT_SECRET")]
    secret: String,

    /// Identity the token is issued to
    #[arg(long, default_value = "agent")]
    identity: String,

    #[arg(long, default_value = "tarmoq")]
    issuer: String,

    /// Token validity in hours
    #[arg(long, default_value = "24")]
    hours: i64,
}

fn main() {
    let args = Args::parse();

    let claims = JwtClaims::new(args.identity.clone(), args.issuer, Duration::hours(args.hours));

    match JwtAuthorizer::encode(args.secret.as_bytes(), &claims) {
        Ok(token) => {
            println!("Identity:  {}", args.identity);
            println!("Valid for: {} hours", args.hours);
            println!("\n{}\n", token);
            println!("Send it as: Authorization: Bearer <token>");
        }
        Err(e) => {
            eprintln!("Failed to generate token: {}", e);
            std::process::exit(1);
        }
    }
}
