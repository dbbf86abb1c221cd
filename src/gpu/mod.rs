//! GPU resource handles: device bring-up, owned buffers/images, named binding tables.

pub mod bindings;
pub mod device;
pub mod resources;

pub use bindings::{BindingTable, BindingTableBuilder};
pub use device::GpuDevice;
pub use resources::{FrameRing, GpuBuffer, PyramidImage};

/// Parse, validate and translate `source` to GLSL ES 3.10 for each entry point.
/// Panics with naga's rendered diagnostic on the first failure.
#[cfg(test)]
pub(crate) fn assert_wgsl_valid(label: &str, source: &str, stage: naga::ShaderStage, entry_points: &[&str]) {
    use naga::back::glsl;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    let module = naga::front::wgsl::parse_str(source)
        .unwrap_or_else(|e| panic!("{label}: {}", e.emit_to_string(source)));
    let info = Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .unwrap_or_else(|e| panic!("{label}: {}", e.emit_to_string(source)));

    for &entry in entry_points {
        assert!(
            module.entry_points.iter().any(|ep| ep.name == entry && ep.stage == stage),
            "{label}: no {stage:?} entry point `{entry}`"
        );
        let mut out = String::new();
        let options = glsl::Options::default();
        let pipeline = glsl::PipelineOptions {
            shader_stage: stage,
            entry_point: entry.to_string(),
            multiview: None,
        };
        glsl::Writer::new(&mut out, &module, &info, &options, &pipeline, Default::default())
            .and_then(|mut writer| writer.write())
            .unwrap_or_else(|e| panic!("{label}/{entry}: GLSL translation failed: {e}"));
    }
}
