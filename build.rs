use std::path::PathBuf;

fn main() {
    // Re-run when registry entries are added or edited
    println!("cargo:rerun-if-changed=registry/");

    // The registry is embedded with include_dir!; an empty directory still has to exist
    let registry_path = PathBuf::from("registry");
    if !registry_path.exists() {
        std::fs::create_dir_all(&registry_path).expect("Failed to create registry directory");
    }

    println!("cargo:rustc-env=REGISTRY_DIR={}", registry_path.display());
}
