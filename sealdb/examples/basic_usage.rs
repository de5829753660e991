//! Basic usage example for `SealDB`: seal, search, rotate.

use sealdb::prelude::*;
use sealdb::search::SearchParam;
use sealdb_key_file::FileKeyRegistry;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("SealDB Basic Usage Example");
    println!("==========================\n");

    let key_dir = tempfile::tempdir()?;
    let mut registry = FileKeyRegistry::init(key_dir.path(), "v1")?;
    println!("✓ Key directory initialized at {}\n", key_dir.path().display());

    let vault = Vault::new(&registry, VaultConfig::default())?;

    // Seal a value: ciphertext column, blind index column, key id column.
    let sealed = vault.seal_str(Some("Alice@Example.com"), Normalizer::Email)?;
    let ciphertext = sealed.ciphertext.clone().unwrap_or_default();
    println!("Key id:      {}", sealed.key_id);
    println!("Envelope:    {} bytes", ciphertext.len());
    println!("Blind index: {}\n", hex::encode(sealed.blind_index.unwrap_or_default()));

    let decrypted = vault.decrypt(Some(&ciphertext))?.unwrap_or_default();
    println!("✓ Decrypted: {}\n", String::from_utf8_lossy(&decrypted));

    // Rotate to v2 while v1 stays active for reads and searches.
    registry.generate_key("v2")?;
    registry.set_current("v2")?;
    let vault = Vault::new(&registry, VaultConfig::default())?;
    println!("Active keys: {:?} (default {})", vault.active_key_ids(), vault.default_key_id());

    let condition =
        vault.build_condition_str("email", Some("alice@example.com"), Normalizer::Email, 1);
    println!("Search:      {}", condition.predicate());
    for (i, param) in condition.parameters().iter().enumerate() {
        match param {
            SearchParam::KeyId(key_id) => println!("  ${} = {key_id}", i + 1),
            SearchParam::BlindIndex(index) => println!("  ${} = {}", i + 1, hex::encode(index)),
        }
    }

    println!("\nNeeds rotation: {}", vault.needs_rotation(Some(&ciphertext)));
    let rotated = vault.rotate_value(Some(&ciphertext))?.unwrap_or_default();
    let rotated_index = vault.rotate_blind_index(Some(b"alice@example.com"));
    println!("✓ Rotated to {} ({} bytes)", vault.default_key_id(), rotated.len());
    println!("  New index: {}", hex::encode(rotated_index.unwrap_or_default()));
    println!("Needs rotation: {}", vault.needs_rotation(Some(&rotated)));

    vault.close();
    println!("\n✓ Vault closed, key material scrubbed");

    Ok(())
}
