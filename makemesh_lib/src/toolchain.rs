use crate::PipelineError;
use log::debug;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable overriding the Python interpreter used to launch all tools
pub const PYTHON_ENV: &str = "MAKEMESH_PYTHON";
/// Environment variable overriding the Wonder3D installation directory
pub const WONDER3D_DIR_ENV: &str = "MAKEMESH_WONDER3D_DIR";
/// Environment variable overriding the DreamGaussian installation directory
pub const DREAMGAUSSIAN_DIR_ENV: &str = "MAKEMESH_DREAMGAUSSIAN_DIR";

const DEFAULT_PYTHON: &str = "python";
const DEFAULT_WONDER3D_DIR: &str = "/app/wonder3d";
const DEFAULT_DREAMGAUSSIAN_DIR: &str = "/app/dreamgaussian";

/// Locations of the external tools invoked by the pipeline
///
/// All tools are Python entry points started by the same interpreter. The multi-view synthesis
/// runs inside the Wonder3D installation, reconstruction, mesh cleanup and export run inside the
/// DreamGaussian installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    /// Interpreter used to run the tools, either a command name looked up in `PATH` or a path
    pub python: OsString,
    /// Installation directory of Wonder3D (working directory of the multi-view stage)
    pub wonder3d_dir: PathBuf,
    /// Installation directory of DreamGaussian (working directory of all remaining stages)
    pub dreamgaussian_dir: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON.into(),
            wonder3d_dir: DEFAULT_WONDER3D_DIR.into(),
            dreamgaussian_dir: DEFAULT_DREAMGAUSSIAN_DIR.into(),
        }
    }
}

impl Toolchain {
    /// Returns the default toolchain with overrides from the `MAKEMESH_*` environment variables applied
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Returns the default toolchain with overrides looked up using the given function
    pub fn from_lookup<F: Fn(&str) -> Option<OsString>>(lookup: F) -> Self {
        let mut toolchain = Self::default();
        let get = |key: &str| {
            lookup(key).filter(|v| !v.is_empty()).inspect(|v| {
                debug!("Toolchain override from {}: \"{}\"", key, v.to_string_lossy())
            })
        };

        if let Some(python) = get(PYTHON_ENV) {
            toolchain.python = python;
        }
        if let Some(dir) = get(WONDER3D_DIR_ENV) {
            toolchain.wonder3d_dir = dir.into();
        }
        if let Some(dir) = get(DREAMGAUSSIAN_DIR_ENV) {
            toolchain.dreamgaussian_dir = dir.into();
        }

        toolchain
    }

    /// Checks that the installation directories (and the interpreter, if given as a path) exist
    pub fn verify(&self) -> Result<(), PipelineError> {
        let python = Path::new(&self.python);
        if python.components().count() > 1 && !python.is_file() {
            return Err(PipelineError::MissingToolchain {
                what: "Python interpreter",
                path: python.to_path_buf(),
            });
        }

        for (what, dir) in [
            ("Wonder3D installation", &self.wonder3d_dir),
            ("DreamGaussian installation", &self.dreamgaussian_dir),
        ] {
            if !dir.is_dir() {
                return Err(PipelineError::MissingToolchain {
                    what,
                    path: dir.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_point_to_container_layout() {
        let toolchain = Toolchain::from_lookup(|_| None);
        assert_eq!(toolchain, Toolchain::default());
        assert_eq!(toolchain.python, OsString::from("python"));
        assert_eq!(toolchain.wonder3d_dir, Path::new("/app/wonder3d"));
        assert_eq!(toolchain.dreamgaussian_dir, Path::new("/app/dreamgaussian"));
    }

    #[test]
    fn environment_overrides_are_applied() {
        let env = HashMap::from([
            (PYTHON_ENV, "/opt/conda/bin/python3"),
            (DREAMGAUSSIAN_DIR_ENV, "/opt/dg"),
            (WONDER3D_DIR_ENV, ""),
        ]);
        let toolchain = Toolchain::from_lookup(|key| env.get(key).map(OsString::from));

        assert_eq!(toolchain.python, OsString::from("/opt/conda/bin/python3"));
        assert_eq!(toolchain.dreamgaussian_dir, Path::new("/opt/dg"));
        // Empty values are ignored
        assert_eq!(toolchain.wonder3d_dir, Path::new("/app/wonder3d"));
    }

    #[test]
    fn verify_reports_missing_installation() -> Result<(), Box<dyn std::error::Error>> {
        let install = tempfile::tempdir()?;
        let mut toolchain = Toolchain {
            python: "python".into(),
            wonder3d_dir: install.path().to_path_buf(),
            dreamgaussian_dir: install.path().to_path_buf(),
        };
        assert!(toolchain.verify().is_ok());

        toolchain.dreamgaussian_dir = install.path().join("missing");
        match toolchain.verify() {
            Err(PipelineError::MissingToolchain { what, path }) => {
                assert_eq!(what, "DreamGaussian installation");
                assert_eq!(path, install.path().join("missing"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        toolchain.dreamgaussian_dir = install.path().to_path_buf();
        toolchain.python = install.path().join("bin/python").into();
        assert!(matches!(
            toolchain.verify(),
            Err(PipelineError::MissingToolchain { .. })
        ));
        Ok(())
    }
}
