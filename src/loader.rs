use std::path::Path;

use anyhow::Context as _;

use crate::error::RenderError;

/// One triangle mesh, flattened the way the compute program reads it:
/// positions as consecutive xyz floats, indices as u32 triples.
pub struct LoadedMesh {
    pub positions: Vec<f32>,
    pub indices: Vec<u32>,
}

impl LoadedMesh {
    pub fn vertex_count(&self) -> u32 {
        (self.positions.len() / 3) as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Imports a glTF file containing exactly one mesh with one triangle
/// primitive; anything else fails with `UnsupportedSceneLayout`.
pub fn load_mesh(path: impl AsRef<Path>) -> anyhow::Result<LoadedMesh> {
    let (document, buffers, _images) = gltf::import(path)?;

    let meshes: Vec<gltf::Mesh> = document.meshes().collect();
    let primitives: usize = meshes.iter().map(|mesh| mesh.primitives().count()).sum();
    ensure_single_shape(meshes.len(), primitives)?;

    let primitive = meshes[0].primitives().next().unwrap();
    assert_eq!(primitive.mode(), gltf::mesh::Mode::Triangles);

    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));

    let mut positions = Vec::new();
    for position in reader
        .read_positions()
        .context("mesh primitive has no positions")?
    {
        positions.extend_from_slice(&position);
    }

    let indices = reader
        .read_indices()
        .map(|indices| indices.into_u32().collect())
        .unwrap_or_else(|| (0..(positions.len() / 3) as u32).collect());

    Ok(LoadedMesh { positions, indices })
}

fn ensure_single_shape(meshes: usize, primitives: usize) -> Result<(), RenderError> {
    if meshes == 1 && primitives == 1 {
        Ok(())
    } else {
        Err(RenderError::UnsupportedSceneLayout { meshes, primitives })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mesh_single_primitive_passes() {
        assert!(ensure_single_shape(1, 1).is_ok());
    }

    #[test]
    fn extra_shapes_are_unsupported() {
        for (meshes, primitives) in [(0, 0), (2, 2), (1, 2), (1, 0)] {
            let err = ensure_single_shape(meshes, primitives).unwrap_err();
            assert!(matches!(err, RenderError::UnsupportedSceneLayout { .. }));
        }
    }

    #[test]
    fn counts_derive_from_flat_arrays() {
        let mesh = LoadedMesh {
            positions: vec![0.0, 1.0, 0.0, -1.0, -1.0, 0.0, 1.0, -1.0, 0.0],
            indices: vec![0, 1, 2],
        };
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
    }
}
