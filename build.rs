//! Build script for smiol
//!
//! When the `mpi` feature is enabled, this script:
//! 1. Finds the MPI installation via pkg-config or mpicc
//! 2. Compiles the C shim (smiol_shim.c)
//! 3. Links against the MPI library (and parallel-netCDF for `pnetcdf`)
//!
//! Without `mpi`, the crate has no native dependencies and nothing is
//! compiled here.

use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=csrc/smiol_shim.c");
    println!("cargo:rerun-if-changed=csrc/smiol_shim.h");

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let with_pnetcdf = env::var_os("CARGO_FEATURE_PNETCDF").is_some();

    // Try to find MPI configuration
    let mpi_config = find_mpi_config();

    // Build the C shim
    let mut build = cc::Build::new();
    build
        .file("csrc/smiol_shim.c")
        .include("csrc")
        .warnings(true)
        .extra_warnings(true);

    // Add MPI include paths
    for path in &mpi_config.include_paths {
        build.include(path);
    }

    if with_pnetcdf {
        build.define("SMIOL_PNETCDF", None);
        if let Some(dir) = pnetcdf_dir() {
            build.include(dir.join("include"));
        }
    }

    // Set optimization level
    if env::var("PROFILE").unwrap_or_default() == "release" {
        build.opt_level(3);
    }

    // Compile
    build.compile("smiol_shim");

    // Link MPI library
    for path in &mpi_config.link_paths {
        println!("cargo:rustc-link-search=native={}", path.display());
        // Add RPATH so the binary finds the correct libmpi at runtime
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
    }

    for lib in &mpi_config.libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    if with_pnetcdf {
        if let Some(dir) = pnetcdf_dir() {
            println!(
                "cargo:rustc-link-search=native={}",
                dir.join("lib").display()
            );
            println!(
                "cargo:rustc-link-arg=-Wl,-rpath,{}",
                dir.join("lib").display()
            );
        }
        println!("cargo:rustc-link-lib=pnetcdf");
    }
}

/// Root of a parallel-netCDF installation, from PNETCDF_DIR or common prefixes.
fn pnetcdf_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("PNETCDF_DIR") {
        return Some(PathBuf::from(dir));
    }
    for prefix in &["/usr", "/usr/local", "/opt/pnetcdf"] {
        let root = PathBuf::from(prefix);
        if root.join("include/pnetcdf.h").exists() {
            return Some(root);
        }
    }
    None
}

struct MpiConfig {
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
}

fn find_mpi_config() -> MpiConfig {
    // Strategy 1: Use MPI_PKG_CONFIG environment variable
    if let Ok(pkg_name) = env::var("MPI_PKG_CONFIG") {
        if let Ok(config) = try_pkg_config(&pkg_name) {
            eprintln!("Found MPI via MPI_PKG_CONFIG={pkg_name}");
            return config;
        }
    }

    // Strategy 2: Try common pkg-config names
    for pkg_name in &["mpich", "ompi", "mpi"] {
        if let Ok(config) = try_pkg_config(pkg_name) {
            eprintln!("Found MPI via pkg-config: {pkg_name}");
            return config;
        }
    }

    // Strategy 3: Use mpicc -show
    if let Ok(config) = try_mpicc() {
        eprintln!("Found MPI via mpicc");
        return config;
    }

    // Strategy 4: Check for Cray environment
    if let Ok(mpich_dir) = env::var("CRAY_MPICH_DIR") {
        eprintln!("Found Cray MPI at {mpich_dir}");
        return MpiConfig {
            include_paths: vec![PathBuf::from(format!("{mpich_dir}/include"))],
            link_paths: vec![PathBuf::from(format!("{mpich_dir}/lib"))],
            libs: vec!["mpi".to_string()],
        };
    }

    // Strategy 5: Try common installation paths
    for prefix in &["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi"] {
        let include = PathBuf::from(format!("{prefix}/include"));
        let lib = PathBuf::from(format!("{prefix}/lib"));
        if include.join("mpi.h").exists() {
            eprintln!("Found MPI at {prefix}");
            return MpiConfig {
                include_paths: vec![include],
                link_paths: vec![lib],
                libs: vec!["mpi".to_string()],
            };
        }
    }

    panic!(
        "Could not find MPI installation. Please ensure MPICH or OpenMPI is installed and either:\n\
         - Set MPI_PKG_CONFIG to the pkg-config name (e.g., 'mpich')\n\
         - Ensure 'mpicc' is in PATH\n\
         - Set CRAY_MPICH_DIR for Cray systems"
    );
}

fn try_pkg_config(name: &str) -> Result<MpiConfig, pkg_config::Error> {
    let lib = pkg_config::Config::new()
        .cargo_metadata(false) // We'll handle linking ourselves
        .probe(name)?;

    Ok(MpiConfig {
        include_paths: lib.include_paths,
        link_paths: lib.link_paths,
        libs: lib.libs,
    })
}

fn try_mpicc() -> Result<MpiConfig, String> {
    let mpicc = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());

    let output = Command::new(&mpicc)
        .arg("-show")
        .output()
        .map_err(|e| format!("Failed to run '{mpicc}': {e}"))?;

    if !output.status.success() {
        return Err("mpicc -show failed".to_string());
    }

    let show_output = String::from_utf8_lossy(&output.stdout);
    parse_mpicc_show(&show_output)
}

#[allow(clippy::unnecessary_wraps)]
fn parse_mpicc_show(output: &str) -> Result<MpiConfig, String> {
    let mut include_paths = Vec::new();
    let mut link_paths = Vec::new();
    let mut libs = Vec::new();

    for part in output.split_whitespace() {
        if let Some(path) = part.strip_prefix("-I") {
            include_paths.push(PathBuf::from(path));
        } else if let Some(path) = part.strip_prefix("-L") {
            link_paths.push(PathBuf::from(path));
        } else if let Some(lib) = part.strip_prefix("-l") {
            libs.push(lib.to_string());
        }
    }

    // Ensure we have at least the basic MPI library
    if libs.is_empty() {
        libs.push("mpi".to_string());
    }

    Ok(MpiConfig {
        include_paths,
        link_paths,
        libs,
    })
}
