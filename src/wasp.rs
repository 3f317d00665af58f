//! WASP: blocked, wavelet-compressed variables stored across a set of
//! container files, one per level of detail.
//!
//! Variables defined without blocking are plain container variables. A
//! blocked variable is stored as an array of blocks: every blocked axis is
//! replaced by a `B_<dim>` axis counting blocks, and one trailing axis holds
//! the block's encoded slot for that file's level of detail. File 0 carries
//! the `WASP.*` attributes needed to decode every level.
//!
//! Block work for one `put_vara`/`get_vara` call is spread round-robin over
//! a fixed pool of scoped worker threads. Each worker owns its scratch
//! buffers; all container access goes through one mutex.

use crate::attribute::Attribute;
use crate::codec::{BlockCodec, CodecScratch};
use crate::compression::PayloadCodec;
use crate::container::ContainerFile;
use crate::error::{Result, VdcError};
use crate::io::IoManager;
use crate::layout::{
    block_align, block_counts, block_into, for_each_run, to_block_coords, unblock_into, vproduct,
    ExtensionMode, StrideIter,
};
use crate::types::XType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

pub const ATT_WASP: &str = "WASP";
pub const ATT_NUM_FILES: &str = "WASP.NumFiles";
pub const ATT_WAVELET: &str = "WASP.Wavelet";
pub const ATT_BLOCK_SIZE: &str = "WASP.BlockSize";
pub const ATT_CRATIOS: &str = "WASP.CRatios";
pub const ATT_DIM_NAMES: &str = "WASP.DimNames";
pub const ATT_MISSING_VALUE: &str = "WASP.MissingValue";

const MAX_RANK: usize = 4;

/// Paths of an `n`-file set, one per level of detail: `<base>.nc0`,
/// `<base>.nc1`, ... where `<base>` is `path` up to its last `.nc`
pub fn mkmultipaths(path: &str, n: usize) -> Vec<String> {
    let base = match path.rfind(".nc") {
        Some(p) => &path[..p],
        None => path,
    };
    (0..n.max(1)).map(|i| format!("{}.nc{}", base, i)).collect()
}

/// Files of a set: a single file keeps `path`, several are numbered
fn set_paths(path: &str, numfiles: usize) -> Vec<String> {
    if numfiles > 1 {
        mkmultipaths(path, numfiles)
    } else {
        vec![path.to_string()]
    }
}

/// Default worker count: the detected hardware concurrency
pub fn default_nthreads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Engine-wide settings for a WASP file set
#[derive(Debug, Clone)]
pub struct WaspOptions {
    pub nthreads: usize,
    pub payload_codec: PayloadCodec,
}

impl Default for WaspOptions {
    fn default() -> Self {
        Self {
            nthreads: default_nthreads(),
            payload_codec: PayloadCodec::default(),
        }
    }
}

/// Blocking and compression for a variable definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaspVarParams {
    /// Wavelet name. Empty means blocked but not transformed.
    pub wname: String,
    /// Block shape, slowest axis first. Missing leading axes are 1.
    pub bs: Vec<usize>,
    /// Compression ratio per level of detail, decreasing
    pub cratios: Vec<usize>,
    pub missing_value: Option<f64>,
}

/// Decoded storage layout of a blocked variable
#[derive(Debug, Clone)]
struct VarLayout {
    name: String,
    dims: Vec<usize>,
    bs: Vec<usize>,
    cratios: Vec<usize>,
    codec: Option<BlockCodec>,
    cdim_names: Vec<String>,
    cdims: Vec<usize>,
    encoded_names: Vec<String>,
    encoded_dims: Vec<usize>,
}

impl VarLayout {
    fn build(
        name: &str,
        dim_names: &[String],
        dims: &[usize],
        wname: &str,
        bs: &[usize],
        cratios: &[usize],
    ) -> Result<Self> {
        if bs.len() != dims.len() || dims.is_empty() || dims.len() > MAX_RANK {
            return Err(VdcError::InvalidCompression(format!(
                "{}: block shape {:?} does not fit dimensions {:?}",
                name, bs, dims
            )));
        }
        if bs.iter().any(|&b| b == 0) {
            return Err(VdcError::InvalidCompression(format!(
                "{}: zero block extent in {:?}",
                name, bs
            )));
        }

        let codec = if wname.is_empty() {
            None
        } else {
            Some(BlockCodec::new(wname, bs, cratios)?)
        };
        let encoded_dims = match &codec {
            Some(c) => c.encoded_dims().to_vec(),
            None => vec![vproduct(bs)],
        };

        let nblocks = block_counts(dims, bs);
        let mut cdim_names = Vec::with_capacity(dims.len());
        let mut cdims = Vec::with_capacity(dims.len());
        let mut blocked = Vec::new();
        for i in 0..dims.len() {
            if bs[i] == 1 {
                cdim_names.push(dim_names[i].clone());
                cdims.push(dims[i]);
            } else {
                let bname = format!("B_{}", dim_names[i]);
                blocked.push(bname.clone());
                cdim_names.push(bname);
                cdims.push(nblocks[i]);
            }
        }
        let base = format!("{}_{}", name, blocked.join("X"));
        let encoded_names = (0..encoded_dims.len())
            .map(|i| format!("{}{}", base, i))
            .collect();

        Ok(Self {
            name: name.to_string(),
            dims: dims.to_vec(),
            bs: bs.to_vec(),
            cratios: if codec.is_some() {
                cratios.to_vec()
            } else {
                vec![1]
            },
            codec,
            cdim_names,
            cdims,
            encoded_names,
            encoded_dims,
        })
    }

    /// Read the layout of `name` from the attributes in file 0. Returns
    /// `None` for plain variables.
    fn from_file(file: &ContainerFile, name: &str) -> Result<Option<Self>> {
        if !file.has_var(name) {
            return Err(VdcError::NotFound(format!("variable {}", name)));
        }
        if file.get_att(Some(name), ATT_WASP).is_none() {
            return Ok(None);
        }
        let att = |key: &str| {
            file.get_att(Some(name), key).ok_or_else(|| {
                VdcError::InvalidFormat(format!("{}: missing attribute {}", name, key))
            })
        };

        let dim_names: Vec<String> = att(ATT_DIM_NAMES)?
            .as_text()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut dims = Vec::with_capacity(dim_names.len());
        for d in &dim_names {
            dims.push(
                file.inq_dim(d)
                    .ok_or_else(|| VdcError::InvalidFormat(format!("{}: no dimension {}", name, d)))?,
            );
        }
        let bs: Vec<usize> = att(ATT_BLOCK_SIZE)?
            .as_i64()
            .into_iter()
            .map(|v| v as usize)
            .collect();
        let cratios: Vec<usize> = att(ATT_CRATIOS)?
            .as_i64()
            .into_iter()
            .map(|v| v as usize)
            .collect();
        let wname = att(ATT_WAVELET)?.as_text();

        Self::build(name, &dim_names, &dims, &wname, &bs, &cratios).map(Some)
    }

    fn num_levels(&self) -> usize {
        self.codec.as_ref().map_or(0, |c| c.num_levels())
    }

    /// Array and block shape at refinement `level`
    fn dims_at_level(&self, level: usize) -> (Vec<usize>, Vec<usize>) {
        match &self.codec {
            Some(codec) => level_dims(&self.dims, &self.bs, codec, level),
            None => (self.dims.clone(), self.bs.clone()),
        }
    }

    /// Define this variable's blocked form in the file holding level `lod`
    fn define_in(&self, file: &mut ContainerFile, xtype: XType, lod: usize) -> Result<()> {
        for (name, &len) in self.cdim_names.iter().zip(&self.cdims) {
            file.def_dim(name, len)?;
        }
        file.def_dim(&self.encoded_names[lod], self.encoded_dims[lod])?;
        if !file.has_var(&self.name) {
            let mut dims = self.cdim_names.clone();
            dims.push(self.encoded_names[lod].clone());
            file.def_var(&self.name, xtype, &dims)?;
        }
        Ok(())
    }

    fn slot_start(&self, bstart: &[usize], bs: &[usize]) -> (Vec<usize>, Vec<usize>) {
        let mut start = to_block_coords(bstart, bs);
        start.push(0);
        let count = vec![1; start.len()];
        (start, count)
    }
}

fn level_dims(
    dims: &[usize],
    bs: &[usize],
    codec: &BlockCodec,
    level: usize,
) -> (Vec<usize>, Vec<usize>) {
    let nlevels = codec.num_levels();
    let level = level.min(nlevels);
    let shift = nlevels - level;
    let bsl = codec.transform().shape_at_level(level).to_vec();
    let dims = dims
        .iter()
        .zip(bs)
        .zip(&bsl)
        .map(|((&d, &b), &l)| {
            if b == 1 {
                d
            } else {
                ((d / b) * l + ((d % b) >> shift)).max(1)
            }
        })
        .collect();
    (dims, bsl)
}

/// Dimensions and block shape of a compressed array at refinement `level`
/// (negative for the native grid), without opening any file. Shapes are
/// slowest axis first.
pub fn dims_at_level(
    dims: &[usize],
    bs: &[usize],
    wname: &str,
    cratios: &[usize],
    level: i32,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let codec = BlockCodec::new(wname, bs, cratios)?;
    let nlevels = codec.num_levels();
    let level = if level < 0 { nlevels } else { level as usize };
    if level > nlevels {
        return Err(VdcError::InvalidArgument(format!(
            "refinement level {} exceeds maximum {}",
            level, nlevels
        )));
    }
    Ok(level_dims(dims, bs, &codec, level))
}

fn validate_put(start: &[usize], count: &[usize], bs: &[usize], dims: &[usize]) -> Result<()> {
    check_bounds(start, count, dims)?;
    for i in 0..dims.len() {
        if start[i] % bs[i] != 0 {
            return Err(VdcError::InvalidHyperslab(format!(
                "start {:?} not aligned to block {:?}",
                start, bs
            )));
        }
        if count[i] % bs[i] != 0 && start[i] + count[i] != dims[i] {
            return Err(VdcError::InvalidHyperslab(format!(
                "count {:?} neither block aligned nor reaching the boundary of {:?}",
                count, dims
            )));
        }
    }
    Ok(())
}

fn check_bounds(start: &[usize], count: &[usize], dims: &[usize]) -> Result<()> {
    if start.len() != dims.len() || count.len() != dims.len() {
        return Err(VdcError::InvalidHyperslab(format!(
            "hyperslab rank {} for variable rank {}",
            start.len(),
            dims.len()
        )));
    }
    for i in 0..dims.len() {
        if count[i] < 1 || start[i] + count[i] > dims[i] {
            return Err(VdcError::InvalidHyperslab(format!(
                "start {:?} count {:?} outside dimensions {:?}",
                start, count, dims
            )));
        }
    }
    Ok(())
}

/// Grow-only per-worker buffers
#[derive(Debug, Default)]
struct WorkerScratch {
    block: Vec<f32>,
    slots: Vec<Vec<f32>>,
    codec: CodecScratch,
}

impl WorkerScratch {
    fn prepare(&mut self, block_size: usize, nslots: usize) {
        if self.block.len() < block_size {
            self.block.resize(block_size, 0.0);
        }
        if self.slots.len() < nslots {
            self.slots.resize_with(nslots, Vec::new);
        }
    }
}

/// Run `work` for every block index in `0..nblocks`, round-robin over one
/// worker per scratch slot. Returns the first error any worker hit.
fn run_workers<F>(scratch: &mut [WorkerScratch], nblocks: usize, work: F) -> Result<()>
where
    F: Fn(usize, &mut WorkerScratch) -> Result<()> + Sync,
{
    if nblocks == 0 {
        return Ok(());
    }
    let nthreads = scratch.len().min(nblocks).max(1);
    if nthreads == 1 {
        let slot = scratch
            .first_mut()
            .ok_or_else(|| VdcError::Thread("no worker scratch allocated".to_string()))?;
        for i in 0..nblocks {
            work(i, slot)?;
        }
        return Ok(());
    }

    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<VdcError>> = Mutex::new(None);
    let record = |e: VdcError| {
        failed.store(true, Ordering::Relaxed);
        let mut slot = first_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    };

    thread::scope(|s| {
        for (id, slot) in scratch.iter_mut().take(nthreads).enumerate() {
            let work = &work;
            let failed = &failed;
            let record = &record;
            let spawned = thread::Builder::new()
                .name(format!("wasp-worker-{}", id))
                .spawn_scoped(s, move || {
                    let mut i = id;
                    while i < nblocks && !failed.load(Ordering::Relaxed) {
                        if let Err(e) = work(i, slot) {
                            warn!(worker = id, block = i, error = %e, "block worker failed");
                            record(e);
                            break;
                        }
                        i += nthreads;
                    }
                });
            if let Err(e) = spawned {
                record(VdcError::Thread(format!("spawning worker {}: {}", id, e)));
                break;
            }
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct OpenVar {
    name: String,
    layout: Option<VarLayout>,
    write: bool,
    lod: usize,
    level: usize,
}

/// The open variable, if it is open in the requested direction
fn open_session(open: &Option<OpenVar>, write: bool) -> Result<&OpenVar> {
    match open {
        Some(open) if open.write == write => Ok(open),
        Some(open) => Err(VdcError::InvalidState(format!(
            "{} is open for {}",
            open.name,
            if open.write { "writing" } else { "reading" }
        ))),
        None => Err(VdcError::InvalidState("no variable is open".to_string())),
    }
}

/// An open WASP file set
pub struct WaspFile {
    io: Arc<dyn IoManager>,
    paths: Vec<String>,
    files: Mutex<Vec<ContainerFile>>,
    writable: bool,
    payload_codec: PayloadCodec,
    scratch: Vec<WorkerScratch>,
    open: Option<OpenVar>,
}

impl WaspFile {
    /// Create a set of up to `numfiles` files. Only file 0 is written now;
    /// the others appear when a level of detail first needs them.
    pub fn create(
        io: Arc<dyn IoManager>,
        path: &str,
        numfiles: usize,
        options: &WaspOptions,
    ) -> Result<Self> {
        let numfiles = numfiles.max(1);
        let paths = set_paths(path, numfiles);
        for stale in paths.iter().skip(1).filter(|p| io.exists(p)) {
            io.remove(stale)?;
        }
        let mut file0 = ContainerFile::create(io.clone(), &paths[0], options.payload_codec)?;
        file0.put_att(None, Attribute::new(ATT_WASP, XType::Int32, vec![1i64]))?;
        file0.put_att(
            None,
            Attribute::new(ATT_NUM_FILES, XType::Int32, vec![numfiles as i64]),
        )?;
        debug!(path = %paths[0], numfiles, "created WASP file set");
        Ok(Self::assemble(io, paths, vec![file0], true, options))
    }

    /// Open an existing set, together with every level-of-detail file
    /// written so far. `path` may name the set (`v.nc`) or its first
    /// file (`v.nc0`).
    pub fn open(
        io: Arc<dyn IoManager>,
        path: &str,
        writable: bool,
        options: &WaspOptions,
    ) -> Result<Self> {
        let first = if io.exists(path) {
            path.to_string()
        } else {
            mkmultipaths(path, 1).remove(0)
        };
        let path = first.as_str();
        let file0 = ContainerFile::open(io.clone(), path, writable)?;
        if file0.get_att(None, ATT_WASP).is_none() {
            return Err(VdcError::InvalidFormat(format!("{} is not a WASP file", path)));
        }
        let numfiles = file0
            .get_att(None, ATT_NUM_FILES)
            .and_then(|a| a.as_i64().first().copied())
            .unwrap_or(1)
            .max(1) as usize;

        let paths = set_paths(path, numfiles);
        let mut files = vec![file0];
        for p in paths.iter().skip(1) {
            if !io.exists(p) {
                break;
            }
            files.push(ContainerFile::open(io.clone(), p, writable)?);
        }
        debug!(path, numfiles, present = files.len(), "opened WASP file set");
        Ok(Self::assemble(io, paths, files, writable, options))
    }

    fn assemble(
        io: Arc<dyn IoManager>,
        paths: Vec<String>,
        files: Vec<ContainerFile>,
        writable: bool,
        options: &WaspOptions,
    ) -> Self {
        let scratch = (0..options.nthreads.max(1))
            .map(|_| WorkerScratch::default())
            .collect();
        Self {
            io,
            paths,
            files: Mutex::new(files),
            writable,
            payload_codec: options.payload_codec,
            scratch,
            open: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.paths[0]
    }

    /// Maximum number of files in the set
    pub fn num_files(&self) -> usize {
        self.paths.len()
    }

    /// Number of files present on storage or created this session
    pub fn num_present_files(&self) -> usize {
        self.files.lock().len()
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(VdcError::InvalidState(format!(
                "{} is open read-only",
                self.paths[0]
            )));
        }
        Ok(())
    }

    pub fn def_dim(&self, name: &str, len: usize) -> Result<()> {
        self.check_writable()?;
        self.files.lock()[0].def_dim(name, len)
    }

    pub fn inq_dim(&self, name: &str) -> Option<usize> {
        self.files.lock()[0].inq_dim(name)
    }

    pub fn put_att(&self, var: Option<&str>, att: Attribute) -> Result<()> {
        self.check_writable()?;
        self.files.lock()[0].put_att(var, att)
    }

    pub fn get_att(&self, var: Option<&str>, name: &str) -> Option<Attribute> {
        self.files.lock()[0].get_att(var, name).cloned()
    }

    pub fn att_names(&self, var: Option<&str>) -> Vec<String> {
        self.files.lock()[0].att_names(var)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.files.lock()[0].has_var(name)
    }

    pub fn var_names(&self) -> Vec<String> {
        self.files.lock()[0].var_names()
    }

    /// Define a variable. Without parameters, or with a block of one
    /// element, the variable is a plain container variable.
    pub fn def_var(
        &self,
        name: &str,
        xtype: XType,
        dim_names: &[String],
        params: Option<&WaspVarParams>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut files = self.files.lock();

        let params = match params {
            Some(p) if vproduct(&p.bs) > 1 => p,
            other => {
                files[0].def_var(name, xtype, dim_names)?;
                if let Some(mv) = other.and_then(|p| p.missing_value) {
                    files[0].put_att(
                        Some(name),
                        Attribute::new(ATT_MISSING_VALUE, XType::Double, vec![mv]),
                    )?;
                }
                return Ok(());
            }
        };

        if xtype != XType::Float {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: blocked variables must be FLOAT, not {}",
                name, xtype
            )));
        }
        if files[0].has_var(name) {
            return Err(VdcError::AlreadyExists(format!("variable {}", name)));
        }

        let mut dims = Vec::with_capacity(dim_names.len());
        for d in dim_names {
            dims.push(
                files[0]
                    .inq_dim(d)
                    .ok_or_else(|| VdcError::NotFound(format!("dimension {}", d)))?,
            );
        }
        if params.bs.len() > dims.len() {
            return Err(VdcError::InvalidCompression(format!(
                "{}: block rank {} exceeds variable rank {}",
                name,
                params.bs.len(),
                dims.len()
            )));
        }
        let mut bs = vec![1; dims.len() - params.bs.len()];
        bs.extend_from_slice(&params.bs);

        let cratios = if params.cratios.is_empty() || params.wname.is_empty() {
            vec![1]
        } else {
            params.cratios.clone()
        };
        if !params.wname.is_empty() && cratios.len() > self.paths.len() {
            return Err(VdcError::InvalidCompression(format!(
                "{}: {} levels of detail but only {} files in the set",
                name,
                cratios.len(),
                self.paths.len()
            )));
        }

        let layout = VarLayout::build(name, dim_names, &dims, &params.wname, &bs, &cratios)?;
        for (k, file) in files.iter_mut().enumerate().take(layout.encoded_dims.len()) {
            layout.define_in(file, xtype, k)?;
        }

        let file0 = &mut files[0];
        let to_i64 = |v: &[usize]| v.iter().map(|&x| x as i64).collect::<Vec<i64>>();
        file0.put_att(Some(name), Attribute::new(ATT_WASP, XType::Int32, vec![1i64]))?;
        file0.put_att(
            Some(name),
            Attribute::new(ATT_DIM_NAMES, XType::Text, dim_names.join(" ")),
        )?;
        file0.put_att(
            Some(name),
            Attribute::new(ATT_CRATIOS, XType::Int64, to_i64(&layout.cratios)),
        )?;
        file0.put_att(
            Some(name),
            Attribute::new(ATT_WAVELET, XType::Text, params.wname.as_str()),
        )?;
        file0.put_att(
            Some(name),
            Attribute::new(ATT_BLOCK_SIZE, XType::Int64, to_i64(&bs)),
        )?;
        if let Some(mv) = params.missing_value {
            file0.put_att(
                Some(name),
                Attribute::new(ATT_MISSING_VALUE, XType::Double, vec![mv]),
            )?;
        }
        Ok(())
    }

    fn layout(&self, name: &str) -> Result<Option<VarLayout>> {
        VarLayout::from_file(&self.files.lock()[0], name)
    }

    /// User-level dimension names and lengths of a variable
    pub fn inq_var_dims(&self, name: &str) -> Result<(Vec<String>, Vec<usize>)> {
        let files = self.files.lock();
        let file0 = &files[0];
        match VarLayout::from_file(file0, name)? {
            Some(layout) => {
                let names = file0
                    .get_att(Some(name), ATT_DIM_NAMES)
                    .map(|a| a.as_text())
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                Ok((names, layout.dims))
            }
            None => file0.inq_var_dims(name),
        }
    }

    pub fn inq_var_type(&self, name: &str) -> Option<XType> {
        self.files.lock()[0].inq_var_type(name)
    }

    pub fn inq_var_compressed(&self, name: &str) -> Result<bool> {
        Ok(self.layout(name)?.is_some_and(|l| l.codec.is_some()))
    }

    pub fn inq_var_cratios(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.layout(name)?.map_or_else(|| vec![1], |l| l.cratios))
    }

    /// Coefficients each level of detail adds to a block; empty for
    /// variables without a wavelet
    pub fn inq_var_ncoeffs(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self
            .layout(name)?
            .and_then(|l| l.codec.map(|c| c.ncoeffs().to_vec()))
            .unwrap_or_default())
    }

    pub fn inq_var_missing_value(&self, name: &str) -> Option<f64> {
        self.get_att(Some(name), ATT_MISSING_VALUE)
            .and_then(|a| a.as_f64().first().copied())
    }

    /// Number of refinement levels, including the native grid
    pub fn inq_var_num_ref_levels(&self, name: &str) -> Result<usize> {
        Ok(self.layout(name)?.map_or(0, |l| l.num_levels()) + 1)
    }

    /// Dimension lengths and block shape at refinement `level`; a negative
    /// level selects the native grid
    pub fn inq_var_dimlens(&self, name: &str, level: i32) -> Result<(Vec<usize>, Vec<usize>)> {
        match self.layout(name)? {
            Some(layout) => {
                let level = if level < 0 {
                    layout.num_levels()
                } else {
                    level as usize
                };
                Ok(layout.dims_at_level(level))
            }
            None => {
                let (_, dims) = self.files.lock()[0].inq_var_dims(name)?;
                let bs = vec![1; dims.len()];
                Ok((dims, bs))
            }
        }
    }

    /// Make sure files `0..=upto` exist, creating missing ones and defining
    /// every blocked variable in them
    fn ensure_lod_files(&self, upto: usize) -> Result<()> {
        let mut files = self.files.lock();
        while files.len() <= upto {
            let k = files.len();
            let path = self.paths.get(k).ok_or_else(|| {
                VdcError::InvalidArgument(format!(
                    "level of detail {} beyond the {} files of {}",
                    k,
                    self.paths.len(),
                    self.paths[0]
                ))
            })?;

            let mut file = if self.io.exists(path) {
                ContainerFile::open(self.io.clone(), path, true)?
            } else {
                let mut file = ContainerFile::create(self.io.clone(), path, self.payload_codec)?;
                for key in [ATT_WASP, ATT_NUM_FILES] {
                    if let Some(att) = files[0].get_att(None, key) {
                        file.put_att(None, att.clone())?;
                    }
                }
                file
            };

            for name in files[0].var_names() {
                if let Some(layout) = VarLayout::from_file(&files[0], &name)? {
                    if k < layout.encoded_dims.len() {
                        let xtype = files[0].inq_var_type(&name).unwrap_or(XType::Float);
                        layout.define_in(&mut file, xtype, k)?;
                    }
                }
            }
            debug!(path = %path, lod = k, "added level-of-detail file");
            files.push(file);
        }
        Ok(())
    }

    /// Open a variable for writing levels of detail `0..=lod`; a negative
    /// `lod` writes every level
    pub fn open_var_write(&mut self, name: &str, lod: i32) -> Result<()> {
        self.check_writable()?;
        self.open = None;

        let layout = self.layout(name)?;
        let lod = match &layout {
            Some(l) => {
                let nlod = l.cratios.len();
                let lod = if lod < 0 { nlod - 1 } else { lod as usize };
                if lod >= nlod {
                    return Err(VdcError::InvalidArgument(format!(
                        "{}: level of detail {} with {} compression ratios",
                        name, lod, nlod
                    )));
                }
                self.ensure_lod_files(lod)?;
                lod
            }
            None => 0,
        };

        debug!(var = name, lod, "opened variable for writing");
        self.open = Some(OpenVar {
            name: name.to_string(),
            layout,
            write: true,
            lod,
            level: 0,
        });
        Ok(())
    }

    /// Open a variable for reading at refinement `level` from levels of
    /// detail `0..=lod`. Negative values select the finest available. A
    /// `lod` beyond what has been written is clamped to the finest level
    /// present.
    pub fn open_var_read(&mut self, name: &str, level: i32, lod: i32) -> Result<()> {
        self.open = None;

        let layout = self.layout(name)?;
        let (level, lod) = match &layout {
            Some(l) => {
                let nlevels = l.num_levels();
                let level = if level < 0 { nlevels } else { level as usize };
                if level > nlevels {
                    return Err(VdcError::InvalidArgument(format!(
                        "{}: refinement level {} exceeds maximum {}",
                        name, level, nlevels
                    )));
                }
                let present = self.num_present_files();
                let finest = (l.cratios.len() - 1).min(present - 1);
                let lod = if lod < 0 {
                    finest
                } else {
                    (lod as usize).min(finest)
                };
                (level, lod)
            }
            None => (0, 0),
        };

        debug!(var = name, level, lod, "opened variable for reading");
        self.open = Some(OpenVar {
            name: name.to_string(),
            layout,
            write: false,
            lod,
            level,
        });
        Ok(())
    }

    pub fn close_var(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            debug!(var = %open.name, "closed variable");
        }
        Ok(())
    }

    /// Name, level and level of detail of the open variable
    pub fn open_var_info(&self) -> Option<(&str, usize, usize)> {
        self.open
            .as_ref()
            .map(|o| (o.name.as_str(), o.level, o.lod))
    }

    fn open_for(&self, write: bool) -> Result<&OpenVar> {
        open_session(&self.open, write)
    }

    /// Write a hyperslab of the open variable. For blocked variables `start`
    /// must be block aligned and `count` block aligned or reaching the far
    /// boundary. Where `mask` is false, values are excluded from the block.
    pub fn put_vara(
        &mut self,
        start: &[usize],
        count: &[usize],
        data: &[f32],
        mask: Option<&[bool]>,
    ) -> Result<()> {
        let open = open_session(&self.open, true)?;
        let layout = match &open.layout {
            Some(l) => l,
            None => return self.files.lock()[0].put_vara(&open.name, start, count, data),
        };

        validate_put(start, count, &layout.bs, &layout.dims)?;
        let n = vproduct(count);
        if data.len() < n || mask.is_some_and(|m| m.len() < n) {
            return Err(VdcError::InvalidHyperslab(format!(
                "{}: buffer smaller than hyperslab of {} values",
                layout.name, n
            )));
        }

        let iter = StrideIter::new(start, count, &layout.bs);
        let block_size = vproduct(&layout.bs);
        let nslots = layout.encoded_dims.len();
        let lod = open.lod;
        let files = &self.files;

        run_workers(&mut self.scratch, iter.num(), |i, s| {
            let (bstart, bcount) = iter.ith(i);
            let offset: Vec<usize> = bstart.iter().zip(start).map(|(b, s)| b - s).collect();
            s.prepare(block_size, nslots);
            block_into(
                data,
                count,
                &offset,
                &bcount,
                mask,
                &mut s.block[..block_size],
                &layout.bs,
                ExtensionMode::Symh,
            )?;

            let (slot_start, mut slot_count) = layout.slot_start(&bstart, &layout.bs);
            let last = slot_count.len() - 1;
            match &layout.codec {
                Some(codec) => {
                    codec.decompose(&mut s.block, &mut s.slots, &mut s.codec)?;
                    let mut files = files.lock();
                    for k in 0..=lod {
                        slot_count[last] = layout.encoded_dims[k];
                        files[k].put_vara(&layout.name, &slot_start, &slot_count, &s.slots[k])?;
                    }
                }
                None => {
                    slot_count[last] = block_size;
                    files.lock()[0].put_vara(
                        &layout.name,
                        &slot_start,
                        &slot_count,
                        &s.block[..block_size],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Write the whole open variable
    pub fn put_var(&mut self, data: &[f32], mask: Option<&[bool]>) -> Result<()> {
        let name = self.open_for(true)?.name.clone();
        let (_, dims) = self.inq_var_dims(&name)?;
        let start = vec![0; dims.len()];
        self.put_vara(&start, &dims, data, mask)
    }

    /// Fetch and decode the blocks covering a block-aligned hyperslab at the
    /// open refinement level. Each block is handed to `emit` with its index,
    /// start and valid extent; the decoded values sit in the leading corner
    /// of a block of the full native block shape.
    fn fetch_blocks<E>(&mut self, start: &[usize], count: &[usize], emit: E) -> Result<()>
    where
        E: Fn(usize, &[usize], &[usize], &[f32], &[usize]) -> Result<()> + Sync,
    {
        let open = open_session(&self.open, false)?;
        let layout = open
            .layout
            .as_ref()
            .ok_or_else(|| VdcError::InvalidState(format!("{} is not blocked", open.name)))?;
        let (_, bsl) = layout.dims_at_level(open.level);
        let iter = StrideIter::new(start, count, &bsl);
        let block_size = vproduct(&layout.bs);
        let nslots = layout.encoded_dims.len();
        let (lod, level) = (open.lod, open.level);
        let files = &self.files;

        run_workers(&mut self.scratch, iter.num(), |i, s| {
            let (bstart, bcount) = iter.ith(i);
            let (slot_start, mut slot_count) = layout.slot_start(&bstart, &bsl);
            let last = slot_count.len() - 1;
            s.prepare(block_size, nslots);

            match &layout.codec {
                Some(codec) => {
                    {
                        let files = files.lock();
                        for k in 0..=lod {
                            slot_count[last] = layout.encoded_dims[k];
                            s.slots[k].resize(layout.encoded_dims[k], 0.0);
                            files[k].get_vara(&layout.name, &slot_start, &slot_count, &mut s.slots[k])?;
                        }
                    }
                    codec.reconstruct(&s.slots[..=lod], level, &mut s.block, &mut s.codec)?;
                }
                None => {
                    slot_count[last] = block_size;
                    files.lock()[0].get_vara(
                        &layout.name,
                        &slot_start,
                        &slot_count,
                        &mut s.block[..block_size],
                    )?;
                }
            }
            emit(i, &bstart, &bcount, &s.block[..block_size], &layout.bs)
        })
    }

    fn level_dims(&self) -> Result<Option<(Vec<usize>, Vec<usize>)>> {
        let open = self.open_for(false)?;
        Ok(open.layout.as_ref().map(|l| l.dims_at_level(open.level)))
    }

    /// Read a block-aligned hyperslab of the open variable, in the
    /// coordinates of the open refinement level
    pub fn get_vara(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()> {
        let (dims, bsl) = match self.level_dims()? {
            Some(d) => d,
            None => {
                let name = &self.open_for(false)?.name;
                return self.files.lock()[0].get_vara(name, start, count, out);
            }
        };
        validate_put(start, count, &bsl, &dims)?;
        let n = vproduct(count);
        if out.len() < n {
            return Err(VdcError::InvalidHyperslab(format!(
                "output buffer of {} values for hyperslab of {}",
                out.len(),
                n
            )));
        }

        let out = Mutex::new(out);
        self.fetch_blocks(start, count, |_, bstart, bcount, block, bs| {
            let offset: Vec<usize> = bstart.iter().zip(start).map(|(b, s)| b - s).collect();
            let mut out = out.lock();
            unblock_into(block, bs, bcount, &mut out[..], count, &offset)
        })
    }

    /// Read any in-bounds hyperslab, aligned or not, at the open refinement
    /// level
    pub fn get_vara_region(
        &mut self,
        start: &[usize],
        count: &[usize],
        out: &mut [f32],
    ) -> Result<()> {
        let (dims, bsl) = match self.level_dims()? {
            Some(d) => d,
            None => return self.get_vara(start, count, out),
        };
        check_bounds(start, count, &dims)?;
        let (astart, acount) = block_align(start, count, &bsl, &dims);
        if astart == start && acount == count {
            return self.get_vara(start, count, out);
        }

        let mut aligned = vec![0.0; vproduct(&acount)];
        self.get_vara(&astart, &acount, &mut aligned)?;
        let offset: Vec<usize> = start.iter().zip(&astart).map(|(s, a)| s - a).collect();
        for_each_run(&acount, &offset, count, |at, to, len| {
            out[to..to + len].copy_from_slice(&aligned[at..at + len]);
        });
        Ok(())
    }

    /// Read a block-aligned hyperslab without unblocking: block `i` of the
    /// region, in row-major block order, fills `out[i * b..(i + 1) * b]` where
    /// `b` is the block size at the open refinement level
    pub fn get_vara_block(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()> {
        let (dims, bsl) = self.level_dims()?.ok_or_else(|| {
            VdcError::InvalidState("open variable is not blocked".to_string())
        })?;
        check_bounds(start, count, &dims)?;
        let (astart, acount) = block_align(start, count, &bsl, &dims);
        if astart != start || acount != count {
            return Err(VdcError::InvalidHyperslab(format!(
                "start {:?} count {:?} not aligned to block {:?}",
                start, count, bsl
            )));
        }

        let bsize = vproduct(&bsl);
        let nblocks = StrideIter::new(start, count, &bsl).num();
        if out.len() < nblocks * bsize {
            return Err(VdcError::InvalidHyperslab(format!(
                "output buffer of {} values for {} blocks of {}",
                out.len(),
                nblocks,
                bsize
            )));
        }

        let origin = vec![0; bsl.len()];
        let out = Mutex::new(out);
        self.fetch_blocks(start, count, |i, _, _, block, bs| {
            let mut out = out.lock();
            unblock_into(
                block,
                bs,
                &bsl,
                &mut out[i * bsize..(i + 1) * bsize],
                &bsl,
                &origin,
            )
        })
    }

    /// Read the whole open variable at the open refinement level
    pub fn get_var(&mut self, out: &mut [f32]) -> Result<()> {
        let dims = match self.level_dims()? {
            Some((dims, _)) => dims,
            None => {
                let name = self.open_for(false)?.name.clone();
                self.inq_var_dims(&name)?.1
            }
        };
        let start = vec![0; dims.len()];
        self.get_vara(&start, &dims, out)
    }

    /// Write every modified file in the set
    pub fn sync(&mut self) -> Result<()> {
        for file in self.files.lock().iter_mut() {
            file.sync()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.open = None;
        self.sync()
    }
}

impl std::fmt::Debug for WaspFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaspFile")
            .field("paths", &self.paths)
            .field("writable", &self.writable)
            .field("nthreads", &self.scratch.len())
            .field("open", &self.open.as_ref().map(|o| &o.name))
            .finish()
    }
}
