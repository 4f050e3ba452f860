use std::{env, fs, path::PathBuf};

// Copies the deployment file and subgraph SDL into OUT_DIR so the binary
// can fall back to the embedded defaults when no --config is given.
fn main() {
    println!("cargo:rerun-if-changed=schemas");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let out_schemas = out_dir.join("schemas");
    println!("cargo:rustc-env=OUT_SCHEMAS={}", out_schemas.display());
    fs::create_dir_all(&out_schemas).expect("create OUT_DIR/schemas");

    for entry in fs::read_dir("schemas").expect("schemas directory") {
        let path = entry.expect("schemas entry").path();
        if !path.is_file() {
            continue;
        }
        let file_name = path.file_name().expect("schema file name");
        fs::copy(&path, out_schemas.join(file_name)).expect("copy schema file");
    }
}
