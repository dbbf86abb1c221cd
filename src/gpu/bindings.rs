// src/gpu/bindings.rs
//! Named bind-group layouts.
//!
//! Layout entries are declared once through a fluent builder; bind groups are then
//! filled by *name*. Asking for a name the table does not declare, or leaving a
//! declared slot empty, fails at setup instead of producing a bind group that
//! silently points the shader at the wrong resource.

use std::collections::HashMap;

use wgpu::{BindGroupLayoutEntry, BindingType, ShaderStages};

use crate::error::{Error, Result};

/// Binding names of one layout, in declaration order (= binding index).
#[derive(Debug, Clone)]
pub struct BindingTable {
    label: String,
    names: Vec<&'static str>,
    index: HashMap<&'static str, u32>,
}

impl BindingTable {
    pub fn builder(label: impl Into<String>) -> BindingTableBuilder {
        BindingTableBuilder {
            label: label.into(),
            names: Vec::with_capacity(8),
            entries: Vec::with_capacity(8),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Binding index of `name`.
    pub fn binding(&self, name: &str) -> Result<u32> {
        self.index.get(name).copied().ok_or_else(|| Error::BindingNotFound {
            table: self.label.clone(),
            name: name.to_owned(),
        })
    }

    /// Build a bind group from `(name, resource)` pairs. Every declared binding must be
    /// supplied exactly once.
    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        label: &str,
        resources: &[(&str, wgpu::BindingResource<'_>)],
    ) -> Result<wgpu::BindGroup> {
        let mut entries = Vec::with_capacity(resources.len());
        for (name, resource) in resources {
            let binding = self.binding(name)?;
            if entries.iter().any(|e: &wgpu::BindGroupEntry<'_>| e.binding == binding) {
                return Err(Error::custom(format!(
                    "binding `{name}` supplied twice for `{}`",
                    self.label
                )));
            }
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: resource.clone(),
            });
        }

        if let Some(missing) = self
            .names
            .iter()
            .find(|name| !resources.iter().any(|(given, _)| given == *name))
        {
            return Err(Error::BindingNotFound {
                table: label.to_owned(),
                name: (*missing).to_owned(),
            });
        }

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        }))
    }
}

/// Fluent layout builder. Bindings are numbered in call order.
pub struct BindingTableBuilder {
    label: String,
    names: Vec<&'static str>,
    entries: Vec<BindGroupLayoutEntry>,
}

impl BindingTableBuilder {
    fn push(mut self, name: &'static str, ty: BindingType) -> Self {
        debug_assert!(!self.names.contains(&name), "duplicate binding name {name}");
        self.entries.push(BindGroupLayoutEntry {
            binding: self.entries.len() as u32,
            visibility: ShaderStages::COMPUTE,
            ty,
            count: None,
        });
        self.names.push(name);
        self
    }

    pub fn uniform(self, name: &'static str) -> Self {
        self.push(
            name,
            BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        )
    }

    pub fn storage(self, name: &'static str, read_only: bool) -> Self {
        self.push(
            name,
            BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        )
    }

    /// Unfilterable `texture_2d<f32>`. Also how `Depth32Float` attachments are read.
    pub fn float_texture(self, name: &'static str) -> Self {
        self.push(
            name,
            BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
        )
    }

    /// Write-only storage texture of `format`.
    pub fn storage_texture(self, name: &'static str, format: wgpu::TextureFormat) -> Self {
        self.push(
            name,
            BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
        )
    }

    /// Create the layout and return it with its name table.
    pub fn build(self, device: &wgpu::Device) -> (BindingTable, wgpu::BindGroupLayout) {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&self.label),
            entries: &self.entries,
        });
        log::debug!("Created bind group layout {} ({} bindings)", self.label, self.entries.len());
        (self.into_table(), layout)
    }

    fn into_table(self) -> BindingTable {
        let index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, i as u32))
            .collect();
        BindingTable {
            label: self.label,
            names: self.names,
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cull_table() -> BindingTable {
        BindingTable::builder("test_cull")
            .uniform("camera")
            .storage("objects", true)
            .float_texture("depth_pyramid")
            .storage("visibility", false)
            .into_table()
    }

    #[test]
    fn bindings_are_numbered_in_declaration_order() {
        let table = cull_table();
        assert_eq!(table.len(), 4);
        assert_eq!(table.binding("camera").unwrap(), 0);
        assert_eq!(table.binding("depth_pyramid").unwrap(), 2);
        assert_eq!(table.binding("visibility").unwrap(), 3);
    }

    #[test]
    fn unknown_name_fails_loudly() {
        let table = cull_table();
        let err = table.binding("misc").unwrap_err();
        assert!(err.is_logic());
        assert_eq!(err.to_string(), "binding `misc` not declared in `test_cull`");
    }
}
