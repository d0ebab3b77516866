use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Subdirectory of the working directory receiving the synthesized views
pub const MULTIVIEW_DIR: &str = "multiview";
/// Subdirectory of the multi-view directory containing the RGB views
pub const RGB_SUBDIR: &str = "rgb";
/// Subdirectory of the multi-view directory containing the normal maps
pub const NORMAL_SUBDIR: &str = "normal";
/// Subdirectory of the working directory receiving the reconstruction outputs
pub const RECONSTRUCTION_DIR: &str = "dg";
/// Mesh written by the reconstruction tool
pub const RAW_MESH_FILE: &str = "mesh_raw.obj";
/// Texture image written by the reconstruction tool
pub const TEXTURE_FILE: &str = "texture.png";
/// Mesh written by the cleanup tool
pub const CLEAN_MESH_FILE: &str = "mesh_clean.obj";

const WORK_DIR_PREFIX: &str = "makemesh-";

/// Paths of all intermediate artifacts relative to a working directory root
///
/// The reconstruction tool reads from the `rgb` and `normal` folders of the multi-view directory
/// and writes its mesh and texture with hardcoded file names into its output directory. These
/// fixed names are the only contract between the stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn multiview_dir(&self) -> PathBuf {
        self.root.join(MULTIVIEW_DIR)
    }

    pub fn rgb_dir(&self) -> PathBuf {
        self.multiview_dir().join(RGB_SUBDIR)
    }

    pub fn normal_dir(&self) -> PathBuf {
        self.multiview_dir().join(NORMAL_SUBDIR)
    }

    pub fn reconstruction_dir(&self) -> PathBuf {
        self.root.join(RECONSTRUCTION_DIR)
    }

    pub fn raw_mesh(&self) -> PathBuf {
        self.reconstruction_dir().join(RAW_MESH_FILE)
    }

    pub fn texture(&self) -> PathBuf {
        self.reconstruction_dir().join(TEXTURE_FILE)
    }

    pub fn clean_mesh(&self) -> PathBuf {
        self.reconstruction_dir().join(CLEAN_MESH_FILE)
    }
}

/// Ephemeral working directory of a single pipeline run
///
/// The directory and everything below it is removed when this guard is dropped, no matter if the
/// run finished, failed or was interrupted. A fresh directory with a random name is created for
/// every run, so nothing is carried over between runs.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
    layout: Layout,
}

impl WorkDir {
    /// Creates a new working directory below `parent` (or the system temp directory) and prepares the multi-view directory
    pub fn create(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORK_DIR_PREFIX);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.multiview_dir())?;
        debug!("Created working directory \"{}\"", dir.path().display());

        Ok(Self { dir, layout })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Removes the working directory, reporting errors that dropping the guard would swallow
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!("Removed working directory \"{}\"", path.display());
        Ok(())
    }
}
