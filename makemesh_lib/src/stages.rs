//! The four stages of the pipeline and the invocations of the external tools implementing them

use crate::invocation::Invocation;
use crate::layout::Layout;
use crate::{Parameters, Toolchain};
use std::fmt;
use std::path::PathBuf;

/// Entry point of the multi-view synthesis (relative to the Wonder3D installation)
pub const MULTIVIEW_SCRIPT: &str = "demo.py";
/// Entry point of the reconstruction (relative to the DreamGaussian installation)
pub const RECONSTRUCTION_SCRIPT: &str = "launch.py";
/// Mesh decimation and smoothing tool (relative to the DreamGaussian installation)
pub const MESH_CLEANUP_SCRIPT: &str = "tools/mesh_clean.py";
/// GLB export tool (relative to the DreamGaussian installation)
pub const EXPORT_SCRIPT: &str = "tools/export_glb.py";

/// Number of Laplacian smoothing iterations applied by the mesh cleanup
pub const LAPLACIAN_SMOOTHING_ITERS: u32 = 10;
/// Batch size of the multi-view synthesis
pub const MULTIVIEW_BATCH_SIZE: u32 = 1;

/// A stage of the pipeline, stages always run in the order of [`Stage::ALL`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Synthesis of RGB views and normal maps from the input image
    MultiView,
    /// Gaussian reconstruction of a raw mesh and its texture from the synthesized views
    Reconstruction,
    /// Decimation and Laplacian smoothing of the raw mesh
    MeshCleanup,
    /// Export of the cleaned mesh and texture to the final GLB file
    Export,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::MultiView,
        Stage::Reconstruction,
        Stage::MeshCleanup,
        Stage::Export,
    ];

    /// One-based position of the stage in the pipeline
    pub fn number(self) -> usize {
        match self {
            Stage::MultiView => 1,
            Stage::Reconstruction => 2,
            Stage::MeshCleanup => 3,
            Stage::Export => 4,
        }
    }

    /// Human readable name of the stage
    pub fn name(self) -> &'static str {
        match self {
            Stage::MultiView => "multi-view synthesis",
            Stage::Reconstruction => "reconstruction",
            Stage::MeshCleanup => "mesh cleanup",
            Stage::Export => "GLB export",
        }
    }

    /// Short tag of the tool implementing the stage, used to prefix forwarded tool output
    pub fn tool(self) -> &'static str {
        match self {
            Stage::MultiView => "wonder3d",
            Stage::Reconstruction => "dreamgaussian",
            Stage::MeshCleanup => "mesh_clean",
            Stage::Export => "export_glb",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.name())
    }
}

/// Returns the invocation of the tool implementing the given stage
pub fn invocation(
    stage: Stage,
    toolchain: &Toolchain,
    layout: &Layout,
    params: &Parameters,
) -> Invocation {
    match stage {
        Stage::MultiView => multiview_invocation(toolchain, layout, params),
        Stage::Reconstruction => reconstruction_invocation(toolchain, layout, params),
        Stage::MeshCleanup => mesh_cleanup_invocation(toolchain, layout, params),
        Stage::Export => export_invocation(toolchain, layout, params),
    }
}

/// Wonder3D: renders `views` views of the input image into the multi-view directory
pub fn multiview_invocation(
    toolchain: &Toolchain,
    layout: &Layout,
    params: &Parameters,
) -> Invocation {
    Invocation::new(&toolchain.python, &toolchain.wonder3d_dir)
        .arg(MULTIVIEW_SCRIPT)
        .flag("--input", &params.input)
        .flag("--out_dir", layout.multiview_dir())
        .flag("--n_views", params.views.to_string())
        .flag("--res", params.resolution.to_string())
        .flag("--ckpt", &params.multiview_checkpoint)
        .flag("--bs", MULTIVIEW_BATCH_SIZE.to_string())
}

/// DreamGaussian: reconstructs mesh and texture from the `rgb` and `normal` views written by the multi-view stage
pub fn reconstruction_invocation(
    toolchain: &Toolchain,
    layout: &Layout,
    params: &Parameters,
) -> Invocation {
    Invocation::new(&toolchain.python, &toolchain.dreamgaussian_dir)
        .arg(RECONSTRUCTION_SCRIPT)
        .flag("--img_dir", layout.rgb_dir())
        .flag("--normal_dir", layout.normal_dir())
        .flag("--out_dir", layout.reconstruction_dir())
        .flag("--iters", params.iterations.to_string())
        .flag("--ckpt", &params.reconstruction_checkpoint)
}

/// Decimates and smooths the raw mesh
pub fn mesh_cleanup_invocation(
    toolchain: &Toolchain,
    layout: &Layout,
    params: &Parameters,
) -> Invocation {
    Invocation::new(&toolchain.python, &toolchain.dreamgaussian_dir)
        .arg(MESH_CLEANUP_SCRIPT)
        .arg(layout.raw_mesh())
        .flag("--decimate", format_ratio(params.decimate_ratio))
        .flag("--laplacian", LAPLACIAN_SMOOTHING_ITERS.to_string())
        .flag("--out", layout.clean_mesh())
}

/// Bundles the cleaned mesh and the texture into the output file
pub fn export_invocation(toolchain: &Toolchain, layout: &Layout, params: &Parameters) -> Invocation {
    Invocation::new(&toolchain.python, &toolchain.dreamgaussian_dir)
        .arg(EXPORT_SCRIPT)
        .arg(layout.clean_mesh())
        .arg(layout.texture())
        .arg(&params.output)
}

/// Returns the files and directories a stage has to produce for the following stages
pub fn expected_artifacts(stage: Stage, layout: &Layout, params: &Parameters) -> Vec<PathBuf> {
    match stage {
        Stage::MultiView => vec![layout.rgb_dir(), layout.normal_dir()],
        Stage::Reconstruction => vec![layout.raw_mesh(), layout.texture()],
        Stage::MeshCleanup => vec![layout.clean_mesh()],
        Stage::Export => vec![params.output.clone()],
    }
}

/// Formats a ratio as the shortest representation that parses back to the same value
fn format_ratio(ratio: f64) -> String {
    format!("{:?}", ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{OsStr, OsString};
    use std::path::Path;

    fn test_params() -> Parameters {
        Parameters::new(
            "/in/photo.jpg",
            "/out/model.glb",
            "/weights/wonder3d.ckpt",
            "/weights/dreamgaussian.ckpt",
        )
    }

    fn args(invocation: &Invocation) -> Vec<&str> {
        invocation
            .args()
            .iter()
            .map(|a| a.to_str().expect("test arguments are valid utf-8"))
            .collect()
    }

    #[test]
    fn stages_are_ordered() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.number(), i + 1);
        }
        assert_eq!(
            Stage::Reconstruction.to_string(),
            "stage 2 (reconstruction)"
        );
    }

    #[test]
    fn multiview_invocation_uses_defaults() {
        let toolchain = Toolchain::default();
        let layout = Layout::new("/tmp/work");
        let invocation = multiview_invocation(&toolchain, &layout, &test_params());

        assert_eq!(invocation.program(), "python");
        assert_eq!(invocation.working_dir(), Path::new("/app/wonder3d"));
        assert_eq!(
            args(&invocation),
            vec![
                "demo.py",
                "--input",
                "/in/photo.jpg",
                "--out_dir",
                "/tmp/work/multiview",
                "--n_views",
                "24",
                "--res",
                "512",
                "--ckpt",
                "/weights/wonder3d.ckpt",
                "--bs",
                "1",
            ]
        );
    }

    #[test]
    fn reconstruction_reads_from_multiview_output() {
        let toolchain = Toolchain::default();
        let layout = Layout::new("/tmp/work");
        let params = test_params();

        let multiview = multiview_invocation(&toolchain, &layout, &params);
        let reconstruction = reconstruction_invocation(&toolchain, &layout, &params);

        let mv_dir = Path::new(multiview.flag_value("--out_dir").expect("missing --out_dir"));
        assert_eq!(
            reconstruction.flag_value("--img_dir"),
            Some(mv_dir.join("rgb").as_os_str())
        );
        assert_eq!(
            reconstruction.flag_value("--normal_dir"),
            Some(mv_dir.join("normal").as_os_str())
        );

        assert_eq!(reconstruction.working_dir(), Path::new("/app/dreamgaussian"));
        assert_eq!(
            args(&reconstruction),
            vec![
                "launch.py",
                "--img_dir",
                "/tmp/work/multiview/rgb",
                "--normal_dir",
                "/tmp/work/multiview/normal",
                "--out_dir",
                "/tmp/work/dg",
                "--iters",
                "8000",
                "--ckpt",
                "/weights/dreamgaussian.ckpt",
            ]
        );
    }

    #[test]
    fn cleanup_and_export_use_fixed_file_names() {
        let toolchain = Toolchain::default();
        let layout = Layout::new("/tmp/work");
        let mut params = test_params();
        params.decimate_ratio = 0.5;

        let cleanup = mesh_cleanup_invocation(&toolchain, &layout, &params);
        assert_eq!(
            args(&cleanup),
            vec![
                "tools/mesh_clean.py",
                "/tmp/work/dg/mesh_raw.obj",
                "--decimate",
                "0.5",
                "--laplacian",
                "10",
                "--out",
                "/tmp/work/dg/mesh_clean.obj",
            ]
        );

        let export = export_invocation(&toolchain, &layout, &params);
        assert_eq!(
            args(&export),
            vec![
                "tools/export_glb.py",
                "/tmp/work/dg/mesh_clean.obj",
                "/tmp/work/dg/texture.png",
                "/out/model.glb",
            ]
        );
    }

    #[test]
    fn custom_toolchain_is_used_for_all_stages() {
        let toolchain = Toolchain {
            python: OsString::from("/opt/python"),
            wonder3d_dir: "/opt/w3d".into(),
            dreamgaussian_dir: "/opt/dg".into(),
        };
        let layout = Layout::new("/tmp/work");
        let params = test_params();

        for stage in Stage::ALL {
            let stage_invocation = invocation(stage, &toolchain, &layout, &params);
            assert_eq!(stage_invocation.program(), OsStr::new("/opt/python"));
            let expected_dir = match stage {
                Stage::MultiView => "/opt/w3d",
                _ => "/opt/dg",
            };
            assert_eq!(stage_invocation.working_dir(), Path::new(expected_dir));
        }
    }

    #[test]
    fn ratio_formatting() {
        assert_eq!(format_ratio(0.30), "0.3");
        assert_eq!(format_ratio(1.0), "1.0");
        assert_eq!(format_ratio(0.125), "0.125");
        assert_eq!(format_ratio(0.3333333333), "0.3333333333");
        // Tiny ratios must not be rounded to zero
        assert_eq!(format_ratio(1e-7), "1e-7");
        assert_eq!(format_ratio(1e-7).parse::<f64>(), Ok(1e-7));
    }

    #[test]
    fn artifacts_of_each_stage() {
        let layout = Layout::new("/tmp/work");
        let params = test_params();

        assert_eq!(
            expected_artifacts(Stage::MultiView, &layout, &params),
            vec![
                PathBuf::from("/tmp/work/multiview/rgb"),
                PathBuf::from("/tmp/work/multiview/normal")
            ]
        );
        assert_eq!(
            expected_artifacts(Stage::Export, &layout, &params),
            vec![PathBuf::from("/out/model.glb")]
        );
    }
}
