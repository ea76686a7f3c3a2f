//! Minimal PLY mesh loader
//!
//! Supports ascii and binary little-endian PLY files with `vertex` and
//! `face` elements. Vertex positions are required; normals and colors are
//! optional. Faces are `vertex_indices` lists, fan-triangulated. When the
//! file carries no vertex normals, each triangle gets its geometric face
//! normal instead.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::mesh::triangle::{Triangle, Vertex};

/// Triangle list with mesh-space bounds; vertices are consumed during
/// triangulation and not retained.
pub struct Mesh {
    pub tris: Vec<Triangle>,
    pub lower: Vec3,
    pub upper: Vec3,
}

impl Mesh {
    pub fn load_ply(path: &Path) -> Result<Mesh> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse a PLY stream
    pub fn from_reader(mut reader: impl BufRead) -> Result<Mesh> {
        let header = Header::parse(&mut reader)?;

        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| Error::InvalidPly(format!("truncated body: {}", e)))?;

        let mut verts: Vec<Vertex> = Vec::new();
        let mut faces: Vec<Vec<usize>> = Vec::new();
        let mut has_normals = false;

        match header.format {
            Format::Ascii => {
                let text = String::from_utf8_lossy(&body);
                let mut tokens = text.split_ascii_whitespace();
                for element in &header.elements {
                    match element.name.as_str() {
                        "vertex" => {
                            has_normals = read_vertices_ascii(element, &mut tokens, &mut verts)?
                        }
                        "face" => read_faces_ascii(element, &mut tokens, &mut faces)?,
                        _ => skip_element_ascii(element, &mut tokens)?,
                    }
                }
            }
            Format::BinaryLe => {
                let mut cursor = &body[..];
                for element in &header.elements {
                    match element.name.as_str() {
                        "vertex" => {
                            has_normals = read_vertices_binary(element, &mut cursor, &mut verts)?
                        }
                        "face" => read_faces_binary(element, &mut cursor, &mut faces)?,
                        _ => skip_element_binary(element, &mut cursor)?,
                    }
                }
            }
        }

        Self::assemble(verts, faces, has_normals)
    }

    fn assemble(verts: Vec<Vertex>, faces: Vec<Vec<usize>>, has_normals: bool) -> Result<Mesh> {
        let mut lower = Vec3::splat(f32::INFINITY);
        let mut upper = Vec3::splat(f32::NEG_INFINITY);
        for v in &verts {
            lower = lower.min(v.pos);
            upper = upper.max(v.pos);
        }

        let mut tris = Vec::new();
        for face in &faces {
            if face.len() < 3 {
                continue;
            }
            for &idx in face {
                if idx >= verts.len() {
                    return Err(Error::InvalidPly(format!(
                        "face index {} out of range ({} vertices)",
                        idx,
                        verts.len()
                    )));
                }
            }

            let v0 = face[0];
            for i in 2..face.len() {
                let mut tri = Triangle::new(verts[v0], verts[face[i - 1]], verts[face[i]]);
                if !has_normals {
                    let n = tri.face_normal();
                    if n.length_squared() > 0.0 {
                        for v in &mut tri.verts {
                            v.normal = n;
                        }
                    }
                }
                tris.push(tri);
            }
        }

        log::info!("loaded mesh: {} triangles, {} vertices", tris.len(), verts.len());
        Ok(Mesh { tris, lower, upper })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Format {
    Ascii,
    BinaryLe,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(token: &str) -> Option<Scalar> {
        Some(match token {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Scalar::F32 | Scalar::F64)
    }

    /// Read one little-endian value, advancing the cursor
    fn read_f64(self, cursor: &mut &[u8]) -> Result<f64> {
        let size = self.size();
        if cursor.len() < size {
            return Err(Error::InvalidPly("unexpected end of binary data".into()));
        }
        let (bytes, rest) = cursor.split_at(size);
        *cursor = rest;

        Ok(match self {
            Scalar::I8 => bytes[0] as i8 as f64,
            Scalar::U8 => bytes[0] as f64,
            Scalar::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Scalar::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Scalar::I32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Scalar::U32 => u32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Scalar::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Scalar::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
        })
    }
}

#[derive(Clone, Debug)]
enum PropKind {
    Scalar(Scalar),
    List { count: Scalar, item: Scalar },
}

#[derive(Clone, Debug)]
struct Property {
    name: String,
    kind: PropKind,
}

#[derive(Clone, Debug)]
struct ElementDesc {
    name: String,
    count: usize,
    props: Vec<Property>,
}

struct Header {
    format: Format,
    elements: Vec<ElementDesc>,
}

impl Header {
    fn parse(reader: &mut impl BufRead) -> Result<Header> {
        let mut line = String::new();
        let mut read_line = |line: &mut String| -> Result<()> {
            line.clear();
            let n = reader
                .read_line(line)
                .map_err(|e| Error::InvalidPly(format!("header read failed: {}", e)))?;
            if n == 0 {
                return Err(Error::InvalidPly("truncated header".into()));
            }
            Ok(())
        };

        read_line(&mut line)?;
        if line.trim_end() != "ply" {
            return Err(Error::InvalidPly("missing ply magic".into()));
        }

        let mut format = None;
        let mut elements: Vec<ElementDesc> = Vec::new();

        loop {
            read_line(&mut line)?;
            let mut tokens = line.split_ascii_whitespace();
            match tokens.next() {
                Some("comment") | Some("obj_info") | None => {}
                Some("format") => {
                    format = Some(match tokens.next() {
                        Some("ascii") => Format::Ascii,
                        Some("binary_little_endian") => Format::BinaryLe,
                        Some(other) => {
                            return Err(Error::InvalidPly(format!("unsupported format {}", other)))
                        }
                        None => return Err(Error::InvalidPly("malformed format line".into())),
                    });
                }
                Some("element") => {
                    let name = tokens
                        .next()
                        .ok_or_else(|| Error::InvalidPly("element without name".into()))?;
                    let count: usize = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| Error::InvalidPly("element without count".into()))?;
                    elements.push(ElementDesc {
                        name: name.to_string(),
                        count,
                        props: Vec::new(),
                    });
                }
                Some("property") => {
                    let element = elements
                        .last_mut()
                        .ok_or_else(|| Error::InvalidPly("property before element".into()))?;
                    let first = tokens
                        .next()
                        .ok_or_else(|| Error::InvalidPly("malformed property".into()))?;
                    let kind = if first == "list" {
                        let count = tokens.next().and_then(Scalar::parse);
                        let item = tokens.next().and_then(Scalar::parse);
                        match (count, item) {
                            (Some(count), Some(item)) => PropKind::List { count, item },
                            _ => return Err(Error::InvalidPly("malformed list property".into())),
                        }
                    } else {
                        PropKind::Scalar(Scalar::parse(first).ok_or_else(|| {
                            Error::InvalidPly(format!("unknown property type {}", first))
                        })?)
                    };
                    let name = tokens
                        .next()
                        .ok_or_else(|| Error::InvalidPly("property without name".into()))?;
                    element.props.push(Property {
                        name: name.to_string(),
                        kind,
                    });
                }
                Some("end_header") => break,
                Some(other) => {
                    log::warn!("ignoring unknown header entry: {}", other);
                }
            }
        }

        let format = format.ok_or_else(|| Error::InvalidPly("missing format line".into()))?;
        if !elements.iter().any(|e| e.name == "vertex") {
            return Err(Error::InvalidPly("missing vertex element".into()));
        }
        if !elements.iter().any(|e| e.name == "face") {
            return Err(Error::InvalidPly("missing face element".into()));
        }

        Ok(Header { format, elements })
    }
}

/// Per-vertex property slots recognized by the loader
const VERTEX_PROPS: [&str; 9] = ["x", "y", "z", "nx", "ny", "nz", "red", "green", "blue"];
const VERTEX_DEFAULTS: [f32; 9] = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 255.0, 255.0, 255.0];

fn vertex_slots(element: &ElementDesc) -> (Vec<Option<usize>>, bool) {
    let slots: Vec<Option<usize>> = element
        .props
        .iter()
        .map(|p| VERTEX_PROPS.iter().position(|&name| name == p.name))
        .collect();
    let has = |slot: usize| slots.iter().any(|&s| s == Some(slot));
    let has_normals = has(3) && has(4) && has(5);
    (slots, has_normals)
}

fn push_vertex(values: &[f32; 9], verts: &mut Vec<Vertex>) {
    verts.push(Vertex::new(
        Vec3::new(values[0], values[1], values[2]),
        Vec3::new(values[3], values[4], values[5]),
        Vec3::new(values[6], values[7], values[8]),
    ));
}

/// Color channels read from float properties are rescaled from [0,1]
fn color_scale(prop: &Property, slot: usize) -> f32 {
    match (&prop.kind, slot) {
        (PropKind::Scalar(scalar), 6..=8) if scalar.is_float() => 255.0,
        _ => 1.0,
    }
}

fn next_ascii_f64<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<f64> {
    tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| Error::InvalidPly("unexpected end of ascii data".into()))
}

fn read_vertices_ascii<'a>(
    element: &ElementDesc,
    tokens: &mut impl Iterator<Item = &'a str>,
    verts: &mut Vec<Vertex>,
) -> Result<bool> {
    let (slots, has_normals) = vertex_slots(element);
    verts.reserve(element.count);

    for _ in 0..element.count {
        let mut values = VERTEX_DEFAULTS;
        for (prop, &slot) in element.props.iter().zip(&slots) {
            match prop.kind {
                PropKind::Scalar(_) => {
                    let value = next_ascii_f64(tokens)? as f32;
                    if let Some(slot) = slot {
                        values[slot] = value * color_scale(prop, slot);
                    }
                }
                PropKind::List { .. } => {
                    let count = next_ascii_f64(tokens)? as usize;
                    for _ in 0..count {
                        next_ascii_f64(tokens)?;
                    }
                }
            }
        }
        push_vertex(&values, verts);
    }
    Ok(has_normals)
}

fn read_vertices_binary(
    element: &ElementDesc,
    cursor: &mut &[u8],
    verts: &mut Vec<Vertex>,
) -> Result<bool> {
    let (slots, has_normals) = vertex_slots(element);
    verts.reserve(element.count);

    for _ in 0..element.count {
        let mut values = VERTEX_DEFAULTS;
        for (prop, &slot) in element.props.iter().zip(&slots) {
            match prop.kind {
                PropKind::Scalar(scalar) => {
                    let value = scalar.read_f64(cursor)? as f32;
                    if let Some(slot) = slot {
                        values[slot] = value * color_scale(prop, slot);
                    }
                }
                PropKind::List { count, item } => {
                    let n = count.read_f64(cursor)? as usize;
                    for _ in 0..n {
                        item.read_f64(cursor)?;
                    }
                }
            }
        }
        push_vertex(&values, verts);
    }
    Ok(has_normals)
}

fn read_faces_ascii<'a>(
    element: &ElementDesc,
    tokens: &mut impl Iterator<Item = &'a str>,
    faces: &mut Vec<Vec<usize>>,
) -> Result<()> {
    faces.reserve(element.count);
    for _ in 0..element.count {
        let mut indices = Vec::new();
        for prop in &element.props {
            match prop.kind {
                PropKind::Scalar(_) => {
                    next_ascii_f64(tokens)?;
                }
                PropKind::List { .. } => {
                    let count = next_ascii_f64(tokens)? as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(next_ascii_f64(tokens)? as usize);
                    }
                    if prop.name == "vertex_indices" || prop.name == "vertex_index" {
                        indices = items;
                    }
                }
            }
        }
        faces.push(indices);
    }
    Ok(())
}

fn read_faces_binary(
    element: &ElementDesc,
    cursor: &mut &[u8],
    faces: &mut Vec<Vec<usize>>,
) -> Result<()> {
    faces.reserve(element.count);
    for _ in 0..element.count {
        let mut indices = Vec::new();
        for prop in &element.props {
            match prop.kind {
                PropKind::Scalar(scalar) => {
                    scalar.read_f64(cursor)?;
                }
                PropKind::List { count, item } => {
                    let n = count.read_f64(cursor)? as usize;
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(item.read_f64(cursor)? as usize);
                    }
                    if prop.name == "vertex_indices" || prop.name == "vertex_index" {
                        indices = items;
                    }
                }
            }
        }
        faces.push(indices);
    }
    Ok(())
}

fn skip_element_ascii<'a>(
    element: &ElementDesc,
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<()> {
    for _ in 0..element.count {
        for prop in &element.props {
            match prop.kind {
                PropKind::Scalar(_) => {
                    next_ascii_f64(tokens)?;
                }
                PropKind::List { .. } => {
                    let count = next_ascii_f64(tokens)? as usize;
                    for _ in 0..count {
                        next_ascii_f64(tokens)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn skip_element_binary(element: &ElementDesc, cursor: &mut &[u8]) -> Result<()> {
    for _ in 0..element.count {
        for prop in &element.props {
            match prop.kind {
                PropKind::Scalar(scalar) => {
                    scalar.read_f64(cursor)?;
                }
                PropKind::List { count, item } => {
                    let n = count.read_f64(cursor)? as usize;
                    for _ in 0..n {
                        item.read_f64(cursor)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const QUAD_ASCII: &str = "\
ply
format ascii 1.0
comment one quad
element vertex 4
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
0 1 0
4 0 1 2 3
";

    #[test]
    fn test_ascii_quad_fan_triangulated() {
        let mesh = Mesh::from_reader(Cursor::new(QUAD_ASCII)).unwrap();
        assert_eq!(mesh.tris.len(), 2);
        assert_eq!(mesh.lower, Vec3::ZERO);
        assert_eq!(mesh.upper, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_missing_normals_synthesized_per_face() {
        let mesh = Mesh::from_reader(Cursor::new(QUAD_ASCII)).unwrap();
        for tri in &mesh.tris {
            for v in &tri.verts {
                // Quad lies in the xy plane; face normal is +-z
                assert!(v.normal.z.abs() > 0.999, "normal {:?}", v.normal);
            }
        }
    }

    #[test]
    fn test_missing_color_defaults_white() {
        let mesh = Mesh::from_reader(Cursor::new(QUAD_ASCII)).unwrap();
        assert_eq!(mesh.tris[0].verts[0].color, Vec3::splat(255.0));
    }

    #[test]
    fn test_vertex_normals_and_colors_kept() {
        let ply = "\
ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
property float nx
property float ny
property float nz
property uchar red
property uchar green
property uchar blue
element face 1
property list uchar int vertex_indices
end_header
0 0 0 1 0 0 10 20 30
1 0 0 1 0 0 10 20 30
0 1 0 1 0 0 10 20 30
3 0 1 2
";
        let mesh = Mesh::from_reader(Cursor::new(ply)).unwrap();
        let v = mesh.tris[0].verts[0];
        assert_eq!(v.normal, Vec3::X);
        assert_eq!(v.color, Vec3::new(10.0, 20.0, 30.0));
    }

    #[test]
    fn test_binary_little_endian() {
        let header = "\
ply
format binary_little_endian 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar uint vertex_indices
end_header
";
        let mut data = header.as_bytes().to_vec();
        for pos in [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            for value in pos {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        data.push(3);
        for idx in [0u32, 1, 2] {
            data.extend_from_slice(&idx.to_le_bytes());
        }

        let mesh = Mesh::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(mesh.tris.len(), 1);
        assert_eq!(mesh.tris[0].upper, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_missing_face_element_rejected() {
        let ply = "\
ply
format ascii 1.0
element vertex 1
property float x
property float y
property float z
end_header
0 0 0
";
        match Mesh::from_reader(Cursor::new(ply)) {
            Err(Error::InvalidPly(reason)) => assert!(reason.contains("face")),
            other => panic!("expected InvalidPly, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let ply = "\
ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
0 1 0
3 0 1 9
";
        assert!(matches!(
            Mesh::from_reader(Cursor::new(ply)),
            Err(Error::InvalidPly(_))
        ));
    }
}
