// Mesh data and OBJ import
//
// Every shape in the file is merged into one vertex list with 16-bit
// indices. Identical corners share an index.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Bit patterns of the fields that identify a vertex. The normal is
    /// not part of the identity.
    fn key(&self) -> [u32; 8] {
        let [px, py, pz] = self.pos;
        let [r, g, b] = self.color;
        let [u, v] = self.tex_coord;
        [px, py, pz, r, g, b, u, v].map(f32::to_bits)
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations 0..=3: position, normal, color, texture coordinate
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };

        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, pos)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, tex_coord)),
        ]
    }
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

/// Accumulates triangle corners, reusing the index of any identical vertex
#[derive(Debug, Default)]
pub struct MeshBuilder {
    vertices: Vec<Vertex>,
    indices: Vec<u16>,
    lookup: HashMap<Vertex, u16>,
}

impl MeshBuilder {
    pub fn push(&mut self, vertex: Vertex) -> Result<u16> {
        let index = match self.lookup.get(&vertex) {
            Some(&index) => index,
            None => {
                let index = u16::try_from(self.vertices.len())
                    .context("Mesh has more unique vertices than 16-bit indices can address")?;
                self.vertices.push(vertex);
                self.lookup.insert(vertex, index);
                index
            }
        };

        self.indices.push(index);
        Ok(index)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn build(self, name: impl Into<String>) -> Mesh {
        Mesh {
            name: name.into(),
            vertices: self.vertices,
            indices: self.indices,
        }
    }
}

/// A loaded model: its merged mesh and the diffuse texture its material names
#[derive(Debug)]
pub struct Model {
    pub name: String,
    pub mesh: Mesh,
    pub diffuse_texture: Option<PathBuf>,
}

impl Model {
    /// Load a Wavefront OBJ. Material texture names are looked up by file
    /// name inside `texture_dir`.
    pub fn load(path: &Path, texture_dir: &Path) -> Result<Self> {
        let (shapes, materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: false,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to load model {:?}", path))?;

        let materials = materials.unwrap_or_else(|e| {
            log::warn!("No materials for {:?}: {}", path, e);
            Vec::new()
        });

        let mut builder = MeshBuilder::default();
        for shape in &shapes {
            append_shape(&mut builder, &shape.mesh)
                .with_context(|| format!("Invalid shape '{}' in {:?}", shape.name, path))?;
        }

        if builder.is_empty() {
            anyhow::bail!("Model {:?} contains no triangles", path);
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let diffuse_texture = materials
            .iter()
            .filter_map(|material| material.diffuse_texture.as_deref())
            .find(|texture| !texture.is_empty())
            .map(|texture| resolve_texture(texture_dir, texture));

        let mesh = builder.build(name.clone());

        log::info!(
            "Loaded model '{}': {} shapes, {} vertices, {} indices",
            name,
            shapes.len(),
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok(Self {
            name,
            mesh,
            diffuse_texture,
        })
    }
}

/// Material files may carry paths from another machine; only the file name
/// is kept
pub fn resolve_texture(texture_dir: &Path, texture: &str) -> PathBuf {
    let file_name = texture.rsplit(&['/', '\\'][..]).next().unwrap_or(texture);
    texture_dir.join(file_name)
}

fn append_shape(builder: &mut MeshBuilder, mesh: &tobj::Mesh) -> Result<()> {
    for (corner, &position_index) in mesh.indices.iter().enumerate() {
        let position_index = position_index as usize;

        let pos = triple(&mesh.positions, position_index)
            .with_context(|| format!("Position index {} out of range", position_index))?;

        let normal = mesh
            .normal_indices
            .get(corner)
            .and_then(|&i| triple(&mesh.normals, i as usize))
            .unwrap_or_default();

        // Vertex colors share the position index
        let color = triple(&mesh.vertex_color, position_index).unwrap_or([1.0, 1.0, 1.0]);

        // OBJ has V pointing up, Vulkan samples with V pointing down
        let tex_coord = mesh
            .texcoord_indices
            .get(corner)
            .and_then(|&i| {
                let i = i as usize * 2;
                mesh.texcoords.get(i..i + 2)
            })
            .map(|uv| [uv[0], 1.0 - uv[1]])
            .unwrap_or_default();

        builder.push(Vertex {
            pos,
            normal,
            color,
            tex_coord,
        })?;
    }

    Ok(())
}

fn triple(data: &[f32], index: usize) -> Option<[f32; 3]> {
    data.get(index * 3..index * 3 + 3).map(|s| [s[0], s[1], s[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(pos: [f32; 3], tex_coord: [f32; 2]) -> Vertex {
        Vertex {
            pos,
            normal: [0.0, 0.0, 1.0],
            color: [1.0, 1.0, 1.0],
            tex_coord,
        }
    }

    #[test]
    fn layout_matches_shader_inputs() {
        assert_eq!(size_of::<Vertex>(), 44);
        assert_eq!(Vertex::binding_description().stride, 44);

        let offsets: Vec<_> = Vertex::attribute_descriptions()
            .iter()
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12), (2, 24), (3, 36)]);
    }

    #[test]
    fn identical_corners_share_an_index() {
        let mut builder = MeshBuilder::default();
        let a = vertex([0.0, 0.0, 0.0], [0.0, 0.0]);
        let b = vertex([1.0, 0.0, 0.0], [1.0, 0.0]);
        let c = vertex([1.0, 1.0, 0.0], [1.0, 1.0]);
        let d = vertex([0.0, 1.0, 0.0], [0.0, 1.0]);

        for v in [a, b, c, a, c, d] {
            builder.push(v).unwrap();
        }

        let mesh = builder.build("quad");
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn normal_is_not_part_of_identity() {
        let mut builder = MeshBuilder::default();
        let mut a = vertex([0.0, 0.0, 0.0], [0.5, 0.5]);
        let first = builder.push(a).unwrap();
        a.normal = [1.0, 0.0, 0.0];
        assert_eq!(builder.push(a).unwrap(), first);
    }

    #[test]
    fn comparison_is_bitwise() {
        // 0.0 and -0.0 compare equal as floats but are distinct vertices
        let mut builder = MeshBuilder::default();
        let zero = builder.push(vertex([0.0, 0.0, 0.0], [0.0, 0.0])).unwrap();
        let neg = builder.push(vertex([-0.0, 0.0, 0.0], [0.0, 0.0])).unwrap();
        assert_ne!(zero, neg);

        // NaN positions still deduplicate against themselves
        let nan = vertex([f32::NAN, 0.0, 0.0], [0.0, 0.0]);
        assert_eq!(builder.push(nan).unwrap(), builder.push(nan).unwrap());
    }

    #[test]
    fn index_overflow_is_an_error() {
        let mut builder = MeshBuilder::default();
        for i in 0..=u16::MAX as u32 {
            builder.push(vertex([i as f32, 0.0, 0.0], [0.0, 0.0])).unwrap();
        }
        assert!(builder.push(vertex([-1.0, 0.0, 0.0], [0.0, 0.0])).is_err());
    }

    #[test]
    fn texture_names_resolve_by_file_name() {
        let dir = Path::new("assets/textures");
        assert_eq!(resolve_texture(dir, "room.png"), dir.join("room.png"));
        assert_eq!(resolve_texture(dir, "C:\\art\\room.png"), dir.join("room.png"));
        assert_eq!(resolve_texture(dir, "../maps/room.png"), dir.join("room.png"));
    }

    #[test]
    fn loads_obj_with_material_texture() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();

        std::fs::write(dir.join("quad.mtl"), "newmtl skin\nmap_Kd art\\quad.png\n").unwrap();
        std::fs::write(
            dir.join("quad.obj"),
            "mtllib quad.mtl\n\
             v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             vn 0 0 1\n\
             usemtl skin\n\
             f 1/1/1 2/2/1 3/3/1 4/4/1\n",
        )
        .unwrap();

        let model = Model::load(&dir.join("quad.obj"), Path::new("textures")).unwrap();

        assert_eq!(model.name, "quad");
        assert_eq!(model.mesh.vertices.len(), 4);
        assert_eq!(model.mesh.indices.len(), 6);
        assert_eq!(model.diffuse_texture, Some(PathBuf::from("textures/quad.png")));

        // V is flipped on import
        let top_right = model
            .mesh
            .vertices
            .iter()
            .find(|v| v.pos == [1.0, 1.0, 0.0])
            .unwrap();
        assert_eq!(top_right.tex_coord, [1.0, 0.0]);
        assert_eq!(top_right.normal, [0.0, 0.0, 1.0]);
        assert_eq!(top_right.color, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn missing_model_is_an_error() {
        assert!(Model::load(Path::new("nowhere/missing.obj"), Path::new(".")).is_err());
    }
}
