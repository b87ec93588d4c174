//! Extracts the plugin registration tables into `plugins.json` at build
//! time; the library embeds the result from `OUT_DIR`.

#[path = "src/plugin/metadata.rs"]
mod metadata;

use std::{
    env, fs,
    path::{Path, PathBuf},
};

fn main() {
    println!("cargo:rerun-if-changed=src/plugins");
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let json = match metadata::extract_dir(Path::new("src/plugins")) {
        Ok(json) => json,
        Err(err) => {
            if !err.source_line.is_empty() {
                eprintln!("  {}", err.source_line);
            }
            panic!("Plugin metadata extraction failed: {err}");
        }
    };
    let rendered = serde_json::to_string_pretty(&json).expect("plugins.json serializes");
    fs::write(out_dir.join("plugins.json"), rendered).expect("plugins.json is writable");
}
