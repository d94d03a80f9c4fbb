//! Generate a keygrid signing key.
//!
//! Prints the hex seed (the key-file contents for `keygrid --key-file`) and
//! the public key to paste into the cluster configuration.

use keygrid_types::KeyPair;

fn main() {
    let keypair = KeyPair::generate();
    println!("secret: {}", keypair.to_hex());
    println!("public: {}", keypair.public_key().to_hex());
    println!("fingerprint: {}", keypair.fingerprint());
}
