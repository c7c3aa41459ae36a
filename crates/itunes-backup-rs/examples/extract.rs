pub fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();
    println!("itunes-backup-rs: extract");

    let data = include_bytes!("../fixtures/manifest_v9.plist");

    let result = itunes_backup_rs::ManifestReader::new(data).extract().unwrap();
    println!("{:#?}", result);

    let hash = itunes_backup_rs::ManifestHash::format(&result).unwrap();
    println!("Version: {}", hash.version());
    println!("Iterations: {}", hash.primary().iteration_count);
    if let Some(tier) = hash.secondary() {
        println!("DPIC: {}", tier.dpic);
    }
    println!("{}", hash);
}
