//! Self-describing container files: named dimensions, typed variables and
//! typed attributes, with hyperslab access.
//!
//! A container lives in memory while open and is written whole on
//! [`ContainerFile::sync`] or [`ContainerFile::close`]. On disk it is the
//! magic `VDCF`, a little-endian `u32` format version, one payload codec
//! byte, then the bincode-encoded body compressed with that codec.

use crate::attribute::Attribute;
use crate::compression::PayloadCodec;
use crate::error::{Result, VdcError};
use crate::io::IoManager;
use crate::layout::{for_each_run, vproduct};
use crate::types::XType;
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Magic number for container files
pub const CONTAINER_MAGIC: &[u8; 4] = b"VDCF";

/// Current container format version
pub const CONTAINER_VERSION: u32 = 1;

const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum VarData {
    Float(Vec<f32>),
    Double(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Text(Vec<u8>),
}

impl VarData {
    fn zeros(xtype: XType, n: usize) -> Self {
        match xtype {
            XType::Float => VarData::Float(vec![0.0; n]),
            XType::Double => VarData::Double(vec![0.0; n]),
            XType::Int32 => VarData::Int32(vec![0; n]),
            XType::Int64 => VarData::Int64(vec![0; n]),
            XType::Text => VarData::Text(vec![0; n]),
        }
    }

    fn xtype(&self) -> XType {
        match self {
            VarData::Float(_) => XType::Float,
            VarData::Double(_) => XType::Double,
            VarData::Int32(_) => XType::Int32,
            VarData::Int64(_) => XType::Int64,
            VarData::Text(_) => XType::Text,
        }
    }

    fn len(&self) -> usize {
        match self {
            VarData::Float(v) => v.len(),
            VarData::Double(v) => v.len(),
            VarData::Int32(v) => v.len(),
            VarData::Int64(v) => v.len(),
            VarData::Text(v) => v.len(),
        }
    }

    fn store(&mut self, at: usize, src: &[f32]) {
        fn copy_into<T: Copy + 'static>(dst: &mut [T], src: &[f32])
        where
            f32: AsPrimitive<T>,
        {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.as_();
            }
        }
        let n = src.len();
        match self {
            VarData::Float(v) => v[at..at + n].copy_from_slice(src),
            VarData::Double(v) => copy_into(&mut v[at..at + n], src),
            VarData::Int32(v) => copy_into(&mut v[at..at + n], src),
            VarData::Int64(v) => copy_into(&mut v[at..at + n], src),
            VarData::Text(v) => copy_into(&mut v[at..at + n], src),
        }
    }

    fn load(&self, at: usize, dst: &mut [f32]) {
        fn copy_from<T: AsPrimitive<f32>>(dst: &mut [f32], src: &[T]) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.as_();
            }
        }
        let n = dst.len();
        match self {
            VarData::Float(v) => dst.copy_from_slice(&v[at..at + n]),
            VarData::Double(v) => copy_from(dst, &v[at..at + n]),
            VarData::Int32(v) => copy_from(dst, &v[at..at + n]),
            VarData::Int64(v) => copy_from(dst, &v[at..at + n]),
            VarData::Text(v) => copy_from(dst, &v[at..at + n]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerVar {
    name: String,
    dims: Vec<String>,
    atts: Vec<Attribute>,
    data: VarData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContainerBody {
    dims: Vec<(String, usize)>,
    atts: Vec<Attribute>,
    vars: Vec<ContainerVar>,
}

fn put_att_in(atts: &mut Vec<Attribute>, att: Attribute) {
    match atts.iter_mut().find(|a| a.name() == att.name()) {
        Some(existing) => *existing = att,
        None => atts.push(att),
    }
}

/// An open container file
pub struct ContainerFile {
    io: Arc<dyn IoManager>,
    path: String,
    codec: PayloadCodec,
    writable: bool,
    dirty: bool,
    body: ContainerBody,
}

impl ContainerFile {
    /// Create a new, empty container, replacing any existing file at `path`
    pub fn create(io: Arc<dyn IoManager>, path: &str, codec: PayloadCodec) -> Result<Self> {
        debug!(path, ?codec, "creating container");
        let file = Self {
            io,
            path: path.to_string(),
            codec,
            writable: true,
            dirty: true,
            body: ContainerBody::default(),
        };
        file.persist()?;
        Ok(file)
    }

    /// Open an existing container
    pub fn open(io: Arc<dyn IoManager>, path: &str, writable: bool) -> Result<Self> {
        let bytes = io.read(path)?;
        if bytes.len() < HEADER_LEN || &bytes[0..4] != CONTAINER_MAGIC {
            return Err(VdcError::InvalidFormat(format!(
                "{} is not a container file",
                path
            )));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != CONTAINER_VERSION {
            return Err(VdcError::UnsupportedVersion(version));
        }
        let codec = PayloadCodec::from_header_byte(bytes[8]).ok_or_else(|| {
            VdcError::InvalidFormat(format!("{}: unknown payload codec {}", path, bytes[8]))
        })?;

        let payload = codec.decode(&bytes[HEADER_LEN..])?;
        let body: ContainerBody = bincode::deserialize(&payload)?;
        debug!(path, writable, nvars = body.vars.len(), "opened container");

        Ok(Self {
            io,
            path: path.to_string(),
            codec,
            writable,
            dirty: false,
            body,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(VdcError::InvalidState(format!(
                "{} is open read-only",
                self.path
            )));
        }
        Ok(())
    }

    /// Define a dimension. Redefining with the same length is a no-op.
    pub fn def_dim(&mut self, name: &str, len: usize) -> Result<()> {
        self.check_writable()?;
        match self.inq_dim(name) {
            Some(existing) if existing == len => Ok(()),
            Some(existing) => Err(VdcError::AlreadyExists(format!(
                "dimension {} with length {} (requested {})",
                name, existing, len
            ))),
            None => {
                self.body.dims.push((name.to_string(), len));
                self.dirty = true;
                Ok(())
            }
        }
    }

    pub fn inq_dim(&self, name: &str) -> Option<usize> {
        self.body
            .dims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, len)| *len)
    }

    pub fn dim_names(&self) -> Vec<String> {
        self.body.dims.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Define a variable over previously defined dimensions. Values start
    /// zero-filled.
    pub fn def_var(&mut self, name: &str, xtype: XType, dims: &[String]) -> Result<()> {
        self.check_writable()?;
        if self.find_var(name).is_some() {
            return Err(VdcError::AlreadyExists(format!("variable {}", name)));
        }
        let mut lens = Vec::with_capacity(dims.len());
        for d in dims {
            let len = self
                .inq_dim(d)
                .ok_or_else(|| VdcError::NotFound(format!("dimension {}", d)))?;
            lens.push(len);
        }
        self.body.vars.push(ContainerVar {
            name: name.to_string(),
            dims: dims.to_vec(),
            atts: Vec::new(),
            data: VarData::zeros(xtype, vproduct(&lens)),
        });
        self.dirty = true;
        Ok(())
    }

    fn find_var(&self, name: &str) -> Option<&ContainerVar> {
        self.body.vars.iter().find(|v| v.name == name)
    }

    fn find_var_mut(&mut self, name: &str) -> Result<&mut ContainerVar> {
        let path = &self.path;
        self.body
            .vars
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| VdcError::NotFound(format!("variable {} in {}", name, path)))
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.find_var(name).is_some()
    }

    pub fn var_names(&self) -> Vec<String> {
        self.body.vars.iter().map(|v| v.name.clone()).collect()
    }

    /// External type of a variable
    pub fn inq_var_type(&self, name: &str) -> Option<XType> {
        self.find_var(name).map(|v| v.data.xtype())
    }

    /// Dimension names and lengths of a variable
    pub fn inq_var_dims(&self, name: &str) -> Result<(Vec<String>, Vec<usize>)> {
        let var = self
            .find_var(name)
            .ok_or_else(|| VdcError::NotFound(format!("variable {} in {}", name, self.path)))?;
        let mut lens = Vec::with_capacity(var.dims.len());
        for d in &var.dims {
            lens.push(
                self.inq_dim(d)
                    .ok_or_else(|| VdcError::NotFound(format!("dimension {}", d)))?,
            );
        }
        Ok((var.dims.clone(), lens))
    }

    /// Set an attribute on a variable, or a global attribute when `var` is `None`
    pub fn put_att(&mut self, var: Option<&str>, att: Attribute) -> Result<()> {
        self.check_writable()?;
        match var {
            None => put_att_in(&mut self.body.atts, att),
            Some(name) => put_att_in(&mut self.find_var_mut(name)?.atts, att),
        }
        self.dirty = true;
        Ok(())
    }

    pub fn get_att(&self, var: Option<&str>, name: &str) -> Option<&Attribute> {
        let atts = match var {
            None => &self.body.atts,
            Some(v) => &self.find_var(v)?.atts,
        };
        atts.iter().find(|a| a.name() == name)
    }

    pub fn att_names(&self, var: Option<&str>) -> Vec<String> {
        let atts = match var {
            None => Some(&self.body.atts),
            Some(v) => self.find_var(v).map(|v| &v.atts),
        };
        atts.map(|a| a.iter().map(|a| a.name().to_string()).collect())
            .unwrap_or_default()
    }

    fn check_slab(&self, name: &str, start: &[usize], count: &[usize], n: usize) -> Result<Vec<usize>> {
        let (_, dims) = self.inq_var_dims(name)?;
        if start.len() != dims.len() || count.len() != dims.len() {
            return Err(VdcError::InvalidHyperslab(format!(
                "{}: rank {} hyperslab for rank {} variable",
                name,
                start.len(),
                dims.len()
            )));
        }
        for i in 0..dims.len() {
            if start[i] + count[i] > dims[i] {
                return Err(VdcError::InvalidHyperslab(format!(
                    "{}: start {:?} count {:?} exceeds dimensions {:?}",
                    name, start, count, dims
                )));
            }
        }
        if n < vproduct(count) {
            return Err(VdcError::InvalidHyperslab(format!(
                "{}: buffer of {} values for hyperslab of {}",
                name,
                n,
                vproduct(count)
            )));
        }
        Ok(dims)
    }

    /// Write a hyperslab, converting from `f32` to the variable's type
    pub fn put_vara(&mut self, name: &str, start: &[usize], count: &[usize], data: &[f32]) -> Result<()> {
        self.check_writable()?;
        let dims = self.check_slab(name, start, count, data.len())?;
        let var = self.find_var_mut(name)?;
        for_each_run(&dims, start, count, |at, from, len| {
            var.data.store(at, &data[from..from + len]);
        });
        self.dirty = true;
        Ok(())
    }

    /// Read a hyperslab, converting the variable's type to `f32`
    pub fn get_vara(&self, name: &str, start: &[usize], count: &[usize], data: &mut [f32]) -> Result<()> {
        let dims = self.check_slab(name, start, count, data.len())?;
        let var = self
            .find_var(name)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", name)))?;
        debug_assert_eq!(var.data.len(), vproduct(&dims));
        for_each_run(&dims, start, count, |at, to, len| {
            var.data.load(at, &mut data[to..to + len]);
        });
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let payload = bincode::serialize(&self.body)?;
        let compressed = self.codec.encode(&payload)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + compressed.len());
        bytes.extend_from_slice(CONTAINER_MAGIC);
        bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        bytes.push(self.codec.header_byte());
        bytes.extend_from_slice(&compressed);
        self.io.write(&self.path, &bytes)
    }

    /// Write pending changes to storage
    pub fn sync(&mut self) -> Result<()> {
        if self.writable && self.dirty {
            self.persist()?;
            self.dirty = false;
            debug!(path = %self.path, "synced container");
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

impl std::fmt::Debug for ContainerFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFile")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("writable", &self.writable)
            .field("dims", &self.body.dims)
            .field("vars", &self.var_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIoManager;
    use tempfile::TempDir;

    fn io(dir: &TempDir) -> Arc<dyn IoManager> {
        Arc::new(FileSystemIoManager::new(dir.path()))
    }

    #[test]
    fn test_create_define_reopen() {
        let dir = TempDir::new().unwrap();
        let mut file = ContainerFile::create(io(&dir), "a.nc", PayloadCodec::Zstd).unwrap();
        file.def_dim("y", 3).unwrap();
        file.def_dim("x", 4).unwrap();
        file.def_var("v", XType::Float, &["y".to_string(), "x".to_string()])
            .unwrap();
        file.put_att(None, Attribute::new("title", XType::Text, "demo"))
            .unwrap();
        file.put_att(Some("v"), Attribute::new("scale", XType::Double, vec![2.5]))
            .unwrap();

        let slab: Vec<f32> = (0..6).map(|v| v as f32).collect();
        file.put_vara("v", &[1, 1], &[2, 3], &slab).unwrap();
        file.close().unwrap();

        let file = ContainerFile::open(io(&dir), "a.nc", false).unwrap();
        assert_eq!(file.inq_dim("x"), Some(4));
        assert_eq!(file.get_att(None, "title").unwrap().as_text(), "demo");
        assert_eq!(file.get_att(Some("v"), "scale").unwrap().as_f64(), vec![2.5]);

        let mut all = vec![0.0; 12];
        file.get_vara("v", &[0, 0], &[3, 4], &mut all).unwrap();
        assert_eq!(
            all,
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0, 5.0]
        );
    }

    #[test]
    fn test_type_conversion() {
        let dir = TempDir::new().unwrap();
        let mut file = ContainerFile::create(io(&dir), "t.nc", PayloadCodec::None).unwrap();
        file.def_dim("n", 3).unwrap();
        file.def_var("i", XType::Int32, &["n".to_string()]).unwrap();
        file.put_vara("i", &[0], &[3], &[1.9, -2.2, 3.0]).unwrap();

        let mut out = vec![0.0; 3];
        file.get_vara("i", &[0], &[3], &mut out).unwrap();
        assert_eq!(out, vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_rejects_bad_access() {
        let dir = TempDir::new().unwrap();
        let mut file = ContainerFile::create(io(&dir), "b.nc", PayloadCodec::Deflate).unwrap();
        file.def_dim("n", 4).unwrap();
        assert!(file.def_dim("n", 5).is_err());
        file.def_var("v", XType::Float, &["n".to_string()]).unwrap();
        assert!(file.def_var("v", XType::Float, &["n".to_string()]).is_err());
        assert!(file.def_var("w", XType::Float, &["m".to_string()]).is_err());
        assert!(file.put_vara("v", &[2], &[3], &[0.0; 3]).is_err());
        assert!(file.put_vara("v", &[0], &[3], &[0.0; 2]).is_err());
        file.close().unwrap();

        let mut ro = ContainerFile::open(io(&dir), "b.nc", false).unwrap();
        assert!(ro.def_dim("k", 1).is_err());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        io.write("junk.nc", b"CDF\x01 not ours").unwrap();
        assert!(matches!(
            ContainerFile::open(io, "junk.nc", false),
            Err(VdcError::InvalidFormat(_))
        ));
    }
}
