//! VRtist relay blobs
//!
//! High-frequency updates (transforms streamed every frame, mesh edits) are
//! shipped as self-contained binary blobs and decoded straight into
//! scene-graph calls. No dependency ordering, no validation beyond framing:
//! a stale transform is simply superseded by the next one.
//!
//! Blob layout: `[u8 kind][payload]`, little-endian scalars, strings prefixed
//! with their 4-byte length.

use std::collections::HashMap;

use crate::bytes::{BytesReader, BytesWriter};
use crate::error::{Error, Result};

/// Column-major 4x4 matrix
pub type Matrix = [f32; 16];

pub const IDENTITY: Matrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum BlobKind {
    Transform = 1,
    Mesh = 2,
    Visibility = 3,
    Rename = 4,
    Delete = 5,
    Frame = 6,
}

impl BlobKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Transform),
            2 => Some(Self::Mesh),
            3 => Some(Self::Visibility),
            4 => Some(Self::Rename),
            5 => Some(Self::Delete),
            6 => Some(Self::Frame),
            _ => None,
        }
    }
}

/// Triangulated mesh payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshBlob {
    pub path: String,
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    pub material: Option<String>,
}

/// One relayed VRtist update
#[derive(Debug, Clone, PartialEq)]
pub enum VrtistMessage {
    Transform {
        path: String,
        parent_inverse: Matrix,
        basis: Matrix,
        local: Matrix,
    },
    Mesh(MeshBlob),
    Visibility {
        path: String,
        visible: bool,
    },
    Rename {
        old_path: String,
        new_path: String,
    },
    Delete {
        path: String,
    },
    Frame {
        frame: i32,
    },
}

impl VrtistMessage {
    /// Object path the message targets, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            VrtistMessage::Transform { path, .. }
            | VrtistMessage::Visibility { path, .. }
            | VrtistMessage::Delete { path } => Some(path),
            VrtistMessage::Mesh(mesh) => Some(&mesh.path),
            VrtistMessage::Rename { old_path, .. } => Some(old_path),
            VrtistMessage::Frame { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BytesWriter::new();
        match self {
            VrtistMessage::Transform {
                path,
                parent_inverse,
                basis,
                local,
            } => {
                w.push_u8(BlobKind::Transform as u8);
                w.push_string(path);
                w.push_f32s(parent_inverse);
                w.push_f32s(basis);
                w.push_f32s(local);
            }
            VrtistMessage::Mesh(mesh) => {
                w.push_u8(BlobKind::Mesh as u8);
                w.push_string(&mesh.path);
                w.push_u32(mesh.vertices.len() as u32);
                for v in &mesh.vertices {
                    w.push_f32s(v);
                }
                w.push_u32(mesh.normals.len() as u32);
                for n in &mesh.normals {
                    w.push_f32s(n);
                }
                w.push_u32(mesh.uvs.len() as u32);
                for uv in &mesh.uvs {
                    w.push_f32s(uv);
                }
                w.push_u32(mesh.indices.len() as u32);
                for i in &mesh.indices {
                    w.push_u32(*i);
                }
                match &mesh.material {
                    Some(material) => {
                        w.push_bool(true);
                        w.push_string(material);
                    }
                    None => w.push_bool(false),
                }
            }
            VrtistMessage::Visibility { path, visible } => {
                w.push_u8(BlobKind::Visibility as u8);
                w.push_string(path);
                w.push_bool(*visible);
            }
            VrtistMessage::Rename { old_path, new_path } => {
                w.push_u8(BlobKind::Rename as u8);
                w.push_string(old_path);
                w.push_string(new_path);
            }
            VrtistMessage::Delete { path } => {
                w.push_u8(BlobKind::Delete as u8);
                w.push_string(path);
            }
            VrtistMessage::Frame { frame } => {
                w.push_u8(BlobKind::Frame as u8);
                w.push_i32(*frame);
            }
        }
        w.finish()
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        let mut r = BytesReader::new(blob);
        let tag = r.read_u8()?;
        let kind = BlobKind::from_u8(tag)
            .ok_or_else(|| Error::Codec(format!("unknown VRtist blob kind {}", tag)))?;

        let msg = match kind {
            BlobKind::Transform => VrtistMessage::Transform {
                path: r.read_string()?,
                parent_inverse: r.read_f32s()?,
                basis: r.read_f32s()?,
                local: r.read_f32s()?,
            },
            BlobKind::Mesh => {
                let path = r.read_string()?;
                let count = r.read_count(12)?;
                let vertices = (0..count).map(|_| r.read_f32s()).collect::<Result<_>>()?;
                let count = r.read_count(12)?;
                let normals = (0..count).map(|_| r.read_f32s()).collect::<Result<_>>()?;
                let count = r.read_count(8)?;
                let uvs = (0..count).map(|_| r.read_f32s()).collect::<Result<_>>()?;
                let count = r.read_count(4)?;
                let indices = (0..count).map(|_| r.read_u32()).collect::<Result<_>>()?;
                let material = if r.read_bool()? {
                    Some(r.read_string()?)
                } else {
                    None
                };
                VrtistMessage::Mesh(MeshBlob {
                    path,
                    vertices,
                    normals,
                    uvs,
                    indices,
                    material,
                })
            }
            BlobKind::Visibility => VrtistMessage::Visibility {
                path: r.read_string()?,
                visible: r.read_bool()?,
            },
            BlobKind::Rename => VrtistMessage::Rename {
                old_path: r.read_string()?,
                new_path: r.read_string()?,
            },
            BlobKind::Delete => VrtistMessage::Delete {
                path: r.read_string()?,
            },
            BlobKind::Frame => VrtistMessage::Frame {
                frame: r.read_i32()?,
            },
        };

        r.finish()?;
        Ok(msg)
    }
}

/// Scene-graph calls a VRtist client performs for relayed blobs
pub trait VrtistSink {
    fn set_transform(&mut self, path: &str, parent_inverse: &Matrix, basis: &Matrix, local: &Matrix);
    fn update_mesh(&mut self, mesh: MeshBlob);
    fn set_visibility(&mut self, path: &str, visible: bool);
    fn rename(&mut self, old_path: &str, new_path: &str);
    fn delete(&mut self, path: &str);
    fn set_frame(&mut self, frame: i32);
}

/// Decode `blob` and dispatch it to `sink`
pub fn apply_blob(blob: &[u8], sink: &mut dyn VrtistSink) -> Result<()> {
    match VrtistMessage::decode(blob)? {
        VrtistMessage::Transform {
            path,
            parent_inverse,
            basis,
            local,
        } => sink.set_transform(&path, &parent_inverse, &basis, &local),
        VrtistMessage::Mesh(mesh) => sink.update_mesh(mesh),
        VrtistMessage::Visibility { path, visible } => sink.set_visibility(&path, visible),
        VrtistMessage::Rename { old_path, new_path } => sink.rename(&old_path, &new_path),
        VrtistMessage::Delete { path } => sink.delete(&path),
        VrtistMessage::Frame { frame } => sink.set_frame(frame),
    }
    Ok(())
}

/// Outbound buffer that keeps only the newest transform per object.
///
/// Any non-transform message is a barrier: transforms queued before it are
/// never merged with transforms queued after it, so relative order with
/// renames and deletions is preserved.
#[derive(Debug, Default)]
pub struct TransformCoalescer {
    queue: Vec<VrtistMessage>,
    latest: HashMap<String, usize>,
}

impl TransformCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: VrtistMessage) {
        match &msg {
            VrtistMessage::Transform { path, .. } => match self.latest.get(path) {
                Some(&slot) => self.queue[slot] = msg,
                None => {
                    self.latest.insert(path.clone(), self.queue.len());
                    self.queue.push(msg);
                }
            },
            _ => {
                self.latest.clear();
                self.queue.push(msg);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Encoded blobs in send order
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.latest.clear();
        self.queue.drain(..).map(|msg| msg.encode()).collect()
    }
}
