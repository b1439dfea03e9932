use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Statistical core: no filesystem, network or plotting access.
const CORE_MODULES: [&str; 5] = [
    "src/columns.rs",
    "src/reshape.rs",
    "src/standardize.rs",
    "src/model.rs",
    "src/hmc.rs",
];

const FORBIDDEN: [&str; 7] = [
    "std::fs",
    "File::",
    "ureq::",
    "TcpStream",
    "plotters::",
    "BitMapBackend",
    "serde_json::to_writer",
];

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let build_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=PREPOST_BUILD_TIMESTAMP={build_ts}");

    enforce_core_io_boundary();
}

fn enforce_core_io_boundary() {
    let mut violations = Vec::new();
    for module in CORE_MODULES {
        let Ok(src) = fs::read_to_string(Path::new(module)) else {
            continue;
        };
        for (line_no, line) in src.lines().enumerate() {
            for token in FORBIDDEN {
                if line.contains(token) {
                    violations.push(format!(
                        "{module}:{} contains forbidden token '{token}'",
                        line_no + 1
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: IO reached into the statistical core modules:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("core/IO boundary violated");
    }
}
