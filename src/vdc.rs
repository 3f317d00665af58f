//! The collection engine: define mode, variable sessions and region I/O.
//!
//! A [`Vdc`] owns the [`Catalog`] and enforces the define/stream state
//! machine. Where a variable physically lives, and how it is encoded, is up
//! to its [`VdcBackend`]; [`VdcFile`] is the container-file implementation.
//!
//! Hyperslabs passed to this API list axes X first, and buffers are
//! row-major with X varying fastest.

use crate::attribute::{AttrValues, Attribute};
use crate::catalog::{Catalog, CoordVarDef, DataVarDef};
use crate::config::VdcConfig;
use crate::error::{Result, VdcError};
use crate::layout::vproduct;
use crate::types::{AccessMode, Axis, XType};
use crate::vdc_file::VdcFile;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Physical location of one timestep of a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    pub path: PathBuf,
    /// Index of the timestep within that file
    pub file_ts: usize,
    /// Timesteps stored per file
    pub max_ts: usize,
}

/// Placement and persistence for a collection.
///
/// Shapes exchanged here are spatial only, X first. A backend has at most
/// one variable open at a time.
pub trait VdcBackend {
    /// Prepare storage. Returns the persisted catalog when opening an
    /// existing collection.
    fn initialize(&mut self, mode: AccessMode) -> Result<Option<Catalog>>;

    /// Persist the catalog and create storage for newly defined variables
    fn write_master_meta(&mut self, catalog: &Catalog) -> Result<()>;

    /// File holding timestep `ts` of `var`. For compressed variables this is
    /// the file of level of detail `lod`, clamped to the ratio table, with a
    /// negative value selecting the finest.
    fn get_path(&self, catalog: &Catalog, var: &str, ts: usize, lod: i32) -> Result<VarPath>;

    /// Spatial dimensions and storage block shape at a refinement level
    fn dim_lens_at_level(
        &self,
        catalog: &Catalog,
        var: &str,
        level: i32,
    ) -> Result<(Vec<usize>, Vec<usize>)>;

    fn variable_exists(&self, catalog: &Catalog, ts: usize, var: &str, level: i32, lod: i32)
        -> bool;

    fn open_var_write(&mut self, catalog: &Catalog, ts: usize, var: &str, lod: i32) -> Result<()>;

    fn open_var_read(
        &mut self,
        catalog: &Catalog,
        ts: usize,
        var: &str,
        level: i32,
        lod: i32,
    ) -> Result<()>;

    fn close_var(&mut self) -> Result<()>;

    /// Write a block-aligned spatial hyperslab of the open variable
    fn write(&mut self, start: &[usize], count: &[usize], data: &[f32]) -> Result<()>;

    /// Read a block-aligned spatial hyperslab of the open variable
    fn read(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()>;

    /// Read any in-bounds spatial hyperslab of the open variable
    fn read_region(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()>;

    /// Read a block-aligned hyperslab as whole blocks in block order
    fn read_region_block(
        &mut self,
        start: &[usize],
        count: &[usize],
        out: &mut [f32],
    ) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Z slices buffered by `write_slice`/`read_slice`
#[derive(Debug)]
struct SliceBuffer {
    /// Slices per block row
    chunk: usize,
    /// First slice held in `data`
    first: usize,
    /// Number of slices held in `data`
    held: usize,
    /// Next slice the caller will write or read
    next: usize,
    data: Vec<f32>,
}

#[derive(Debug)]
struct OpenState {
    var: String,
    ts: usize,
    write: bool,
    dims: Vec<usize>,
    bs: Vec<usize>,
    slices: Option<SliceBuffer>,
}

/// A collection of variables
pub struct Vdc<B: VdcBackend = VdcFile> {
    catalog: Catalog,
    mode: AccessMode,
    define_mode: bool,
    new_uniform_vars: Vec<String>,
    config: VdcConfig,
    backend: B,
    open: Option<OpenState>,
}

impl Vdc<VdcFile> {
    /// Open or create the collection whose master file is `path`
    pub fn initialize(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        Self::initialize_with_config(path, mode, VdcConfig::default())
    }

    pub fn initialize_with_config(
        path: impl AsRef<Path>,
        mode: AccessMode,
        config: VdcConfig,
    ) -> Result<Self> {
        config.validate()?;
        let backend = VdcFile::new(path.as_ref(), config.clone())?;
        Self::with_backend(backend, mode, config)
    }
}

impl<B: VdcBackend> Vdc<B> {
    pub fn with_backend(mut backend: B, mode: AccessMode, config: VdcConfig) -> Result<Self> {
        let catalog = backend.initialize(mode)?.unwrap_or_default();
        info!(?mode, nvars = catalog.coord_vars.len() + catalog.data_vars.len(), "initialized collection");
        Ok(Self {
            catalog,
            mode,
            define_mode: mode.is_writable(),
            new_uniform_vars: Vec::new(),
            config,
            backend,
            open: None,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_define_mode(&self) -> bool {
        self.define_mode
    }

    pub fn config(&self) -> &VdcConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn check_define(&self, what: &str) -> Result<()> {
        if !self.define_mode {
            return Err(VdcError::NotDefineMode(what.to_string()));
        }
        Ok(())
    }

    fn check_streaming(&self) -> Result<()> {
        if self.define_mode {
            return Err(VdcError::InvalidState(
                "operation not permitted in define mode".to_string(),
            ));
        }
        Ok(())
    }

    fn check_new(&self, exists: bool, name: &str) -> Result<()> {
        if self.mode == AccessMode::Append && exists {
            return Err(VdcError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    /// Define a dimension together with a uniform coordinate variable of
    /// the same name
    pub fn define_dimension(&mut self, name: &str, length: usize, axis: Axis) -> Result<()> {
        self.check_define("define_dimension")?;
        self.check_new(self.catalog.get_dimension(name).is_some(), name)?;

        self.catalog.define_dimension(name, length, axis)?;
        if let Err(e) = self.define_coord_var_uniform(CoordVarDef::new(name, &[name], axis)) {
            self.catalog.remove_dimension(name);
            return Err(e);
        }
        Ok(())
    }

    pub fn define_coord_var(&mut self, def: CoordVarDef) -> Result<()> {
        self.check_define("define_coord_var")?;
        self.check_new(self.catalog.is_coord_var(&def.name), &def.name)?;
        let params = def
            .compression
            .clone()
            .unwrap_or_else(|| self.config.compression.clone());
        self.catalog.define_coord_var(&def, &params, false)
    }

    /// Define a 1-D coordinate variable with evenly spaced values. Unless
    /// written otherwise, `end_define` fills it with `0..n`.
    pub fn define_coord_var_uniform(&mut self, def: CoordVarDef) -> Result<()> {
        self.check_define("define_coord_var_uniform")?;
        self.check_new(self.catalog.is_coord_var(&def.name), &def.name)?;
        let params = def
            .compression
            .clone()
            .unwrap_or_else(|| self.config.compression.clone());
        self.catalog.define_coord_var(&def, &params, true)?;
        if !self.new_uniform_vars.contains(&def.name) {
            self.new_uniform_vars.push(def.name);
        }
        Ok(())
    }

    pub fn define_data_var(&mut self, def: DataVarDef) -> Result<()> {
        self.check_define("define_data_var")?;
        self.check_new(self.catalog.is_data_var(&def.name), &def.name)?;
        let params = def
            .compression
            .clone()
            .unwrap_or_else(|| self.config.compression.clone());
        self.catalog.define_data_var(&def, &params)
    }

    /// Set an attribute, stored as `xtype`. `var` of `None` sets a global
    /// attribute.
    pub fn put_att(
        &mut self,
        var: Option<&str>,
        name: &str,
        xtype: XType,
        values: impl Into<AttrValues>,
    ) -> Result<()> {
        self.check_define("put_att")?;
        self.catalog
            .put_att(var, Attribute::new(name, xtype, values))
    }

    pub fn get_att(&self, var: Option<&str>, name: &str) -> Option<&Attribute> {
        self.catalog.get_att(var, name)
    }

    /// Leave define mode: persist the catalog and give newly defined
    /// uniform coordinate variables their default values
    pub fn end_define(&mut self) -> Result<()> {
        if !self.define_mode || self.mode == AccessMode::Read {
            return Ok(());
        }
        self.backend.write_master_meta(&self.catalog)?;
        self.define_mode = false;

        for name in std::mem::take(&mut self.new_uniform_vars) {
            let length = self
                .catalog
                .coord_var(&name)
                .and_then(|c| c.base.dimensions.first())
                .map(|d| d.length)
                .ok_or_else(|| VdcError::NotFound(format!("coordinate variable {}", name)))?;
            let values: Vec<f32> = (0..length).map(|i| i as f32).collect();
            self.put_var(&name, -1, &values)?;
        }
        info!(
            ndims = self.catalog.dimensions.len(),
            ncoords = self.catalog.coord_vars.len(),
            ndata = self.catalog.data_vars.len(),
            "ended define mode"
        );
        Ok(())
    }

    pub fn is_compressed(&self, var: &str) -> bool {
        self.catalog.is_compressed(var)
    }

    pub fn is_time_varying(&self, var: &str) -> bool {
        self.catalog.is_time_varying(var)
    }

    pub fn num_time_steps(&self, var: &str) -> Option<usize> {
        self.catalog.num_time_steps(var)
    }

    pub fn num_ref_levels(&self, var: &str) -> Option<usize> {
        self.catalog.num_ref_levels(var)
    }

    pub fn get_path(&self, var: &str, ts: usize, lod: i32) -> Result<VarPath> {
        self.check_streaming()?;
        self.backend.get_path(&self.catalog, var, ts, lod)
    }

    /// Spatial dimensions and block shape of `var` at refinement `level`
    /// (negative for the native grid)
    pub fn get_dim_lens_at_level(&self, var: &str, level: i32) -> Result<(Vec<usize>, Vec<usize>)> {
        self.backend.dim_lens_at_level(&self.catalog, var, level)
    }

    pub fn variable_exists(&self, ts: usize, var: &str, level: i32, lod: i32) -> bool {
        !self.define_mode && self.backend.variable_exists(&self.catalog, ts, var, level, lod)
    }

    fn check_timestep(&self, var: &str, ts: usize) -> Result<()> {
        let nts = self
            .catalog
            .num_time_steps(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        if ts >= nts {
            return Err(VdcError::InvalidArgument(format!(
                "{}: timestep {} of {}",
                var, ts, nts
            )));
        }
        Ok(())
    }

    /// Open `var` at timestep `ts` for writing levels of detail `0..=lod`
    /// (negative for all)
    pub fn open_variable_write(&mut self, ts: usize, var: &str, lod: i32) -> Result<()> {
        self.check_streaming()?;
        if !self.mode.is_writable() {
            return Err(VdcError::InvalidState(
                "collection is open read-only".to_string(),
            ));
        }
        self.close_variable()?;
        self.check_timestep(var, ts)?;

        self.backend.open_var_write(&self.catalog, ts, var, lod)?;
        let (dims, bs) = self.backend.dim_lens_at_level(&self.catalog, var, -1)?;
        debug!(var, ts, lod, "opened variable for writing");
        self.open = Some(OpenState {
            var: var.to_string(),
            ts,
            write: true,
            dims,
            bs,
            slices: None,
        });
        Ok(())
    }

    /// Open `var` at timestep `ts` for reading at refinement `level` from
    /// levels of detail `0..=lod`; negative values select the finest
    pub fn open_variable_read(&mut self, ts: usize, var: &str, level: i32, lod: i32) -> Result<()> {
        self.check_streaming()?;
        self.close_variable()?;
        self.check_timestep(var, ts)?;

        let nlevels = self
            .catalog
            .num_ref_levels(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let level = if level < 0 { nlevels as i32 - 1 } else { level };
        if level as usize >= nlevels {
            return Err(VdcError::InvalidArgument(format!(
                "{}: refinement level {} of {}",
                var, level, nlevels
            )));
        }

        self.backend
            .open_var_read(&self.catalog, ts, var, level, lod)?;
        let (dims, bs) = self.backend.dim_lens_at_level(&self.catalog, var, level)?;
        debug!(var, ts, level, lod, "opened variable for reading");
        self.open = Some(OpenState {
            var: var.to_string(),
            ts,
            write: false,
            dims,
            bs,
            slices: None,
        });
        Ok(())
    }

    /// Close the open variable, flushing any buffered slices
    pub fn close_variable(&mut self) -> Result<()> {
        let open = match self.open.take() {
            Some(o) => o,
            None => return Ok(()),
        };
        let flushed = match &open.slices {
            Some(buf) if open.write && buf.held > 0 => self.flush_slices(&open.dims, buf),
            _ => Ok(()),
        };
        let closed = self.backend.close_var();
        debug!(var = %open.var, ts = open.ts, "closed variable");
        flushed.and(closed)
    }

    /// Name, timestep, spatial dimensions and block shape of the open
    /// variable
    pub fn open_variable_info(&self) -> Option<(&str, usize, &[usize], &[usize])> {
        self.open
            .as_ref()
            .map(|o| (o.var.as_str(), o.ts, o.dims.as_slice(), o.bs.as_slice()))
    }

    fn open_for(&self, write: bool) -> Result<&OpenState> {
        match &self.open {
            Some(o) if o.write == write => Ok(o),
            Some(o) => Err(VdcError::InvalidState(format!(
                "{} is not open for {}",
                o.var,
                if write { "writing" } else { "reading" }
            ))),
            None => Err(VdcError::InvalidState("no variable is open".to_string())),
        }
    }

    fn check_slab(dims: &[usize], start: &[usize], count: &[usize], len: usize) -> Result<()> {
        if start.len() != dims.len() || count.len() != dims.len() {
            return Err(VdcError::InvalidHyperslab(format!(
                "hyperslab rank {} for {} spatial dimensions",
                start.len(),
                dims.len()
            )));
        }
        if (0..dims.len()).any(|i| count[i] == 0 || start[i] + count[i] > dims[i]) {
            return Err(VdcError::InvalidHyperslab(format!(
                "start {:?} count {:?} outside {:?}",
                start, count, dims
            )));
        }
        if len < vproduct(count) {
            return Err(VdcError::InvalidHyperslab(format!(
                "buffer of {} values for hyperslab of {}",
                len,
                vproduct(count)
            )));
        }
        Ok(())
    }

    /// Write a hyperslab of the open variable. `start` must be block
    /// aligned; `count` block aligned or reaching the far boundary.
    pub fn write(&mut self, start: &[usize], count: &[usize], data: &[f32]) -> Result<()> {
        let open = self.open_for(true)?;
        Self::check_slab(&open.dims, start, count, data.len())?;
        self.backend.write(start, count, data)
    }

    /// Read a block-aligned hyperslab of the open variable at its open
    /// refinement level
    pub fn read(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()> {
        let open = self.open_for(false)?;
        Self::check_slab(&open.dims, start, count, out.len())?;
        self.backend.read(start, count, out)
    }

    /// Read the inclusive box `min..=max`, aligned or not
    pub fn read_region(&mut self, min: &[usize], max: &[usize], out: &mut [f32]) -> Result<()> {
        let open = self.open_for(false)?;
        let count = Self::box_count(min, max)?;
        Self::check_slab(&open.dims, min, &count, out.len())?;
        self.backend.read_region(min, &count, out)
    }

    /// Read the block-aligned inclusive box `min..=max` as whole blocks in
    /// block order
    pub fn read_region_block(
        &mut self,
        min: &[usize],
        max: &[usize],
        out: &mut [f32],
    ) -> Result<()> {
        let open = self.open_for(false)?;
        let count = Self::box_count(min, max)?;
        Self::check_slab(&open.dims, min, &count, usize::MAX)?;
        self.backend.read_region_block(min, &count, out)
    }

    fn box_count(min: &[usize], max: &[usize]) -> Result<Vec<usize>> {
        if min.len() != max.len() || min.iter().zip(max).any(|(a, b)| a > b) {
            return Err(VdcError::InvalidHyperslab(format!(
                "invalid region {:?}..={:?}",
                min, max
            )));
        }
        Ok(min.iter().zip(max).map(|(a, b)| b - a + 1).collect())
    }

    /// Split dims into the size of one slice, the number of slices and
    /// the slice block depth
    fn slice_geometry(open: &OpenState) -> (usize, usize, usize) {
        if open.dims.len() < 3 {
            (vproduct(&open.dims), 1, 1)
        } else {
            let nz = open.dims[2];
            (open.dims[0] * open.dims[1], nz, open.bs[2].clamp(1, nz))
        }
    }

    fn flush_slices(&mut self, dims: &[usize], buf: &SliceBuffer) -> Result<()> {
        let n = vproduct(&dims[..2]) * buf.held;
        let start = [0, 0, buf.first];
        let count = [dims[0], dims[1], buf.held];
        self.backend.write(&start, &count, &buf.data[..n])
    }

    /// Write the next Z slice of the open variable. For variables with
    /// fewer than three dimensions the slice is the whole array.
    pub fn write_slice(&mut self, slice: &[f32]) -> Result<()> {
        let open = self.open_for(true)?;
        let (slice_len, nz, chunk) = Self::slice_geometry(open);
        if slice.len() < slice_len {
            return Err(VdcError::InvalidHyperslab(format!(
                "slice of {} values, expected {}",
                slice.len(),
                slice_len
            )));
        }
        if open.dims.len() < 3 {
            let (start, count) = (vec![0; open.dims.len()], open.dims.clone());
            return self.backend.write(&start, &count, slice);
        }

        let mut open = self
            .open
            .take()
            .ok_or_else(|| VdcError::InvalidState("no variable is open".to_string()))?;
        let buf = open.slices.get_or_insert_with(|| SliceBuffer {
            chunk,
            first: 0,
            held: 0,
            next: 0,
            data: Vec::with_capacity(slice_len * chunk),
        });
        if buf.next >= nz {
            self.open = Some(open);
            return Err(VdcError::InvalidArgument(format!(
                "all {} slices already written",
                nz
            )));
        }

        if buf.held == 0 {
            buf.first = buf.next;
            buf.data.clear();
        }
        buf.data.extend_from_slice(&slice[..slice_len]);
        buf.held += 1;
        buf.next += 1;

        let result = if buf.held == buf.chunk || buf.next == nz {
            let r = self.flush_slices(&open.dims, buf);
            buf.held = 0;
            r
        } else {
            Ok(())
        };
        self.open = Some(open);
        result
    }

    /// Read the next Z slice of the open variable at its refinement level
    pub fn read_slice(&mut self, out: &mut [f32]) -> Result<()> {
        let open = self.open_for(false)?;
        let (slice_len, nz, chunk) = Self::slice_geometry(open);
        if out.len() < slice_len {
            return Err(VdcError::InvalidHyperslab(format!(
                "slice buffer of {} values, expected {}",
                out.len(),
                slice_len
            )));
        }
        if open.dims.len() < 3 {
            let (start, count) = (vec![0; open.dims.len()], open.dims.clone());
            return self.backend.read(&start, &count, out);
        }

        let mut open = self
            .open
            .take()
            .ok_or_else(|| VdcError::InvalidState("no variable is open".to_string()))?;
        let buf = open.slices.get_or_insert_with(|| SliceBuffer {
            chunk,
            first: 0,
            held: 0,
            next: 0,
            data: Vec::new(),
        });
        if buf.next >= nz {
            self.open = Some(open);
            return Err(VdcError::InvalidArgument(format!(
                "all {} slices already read",
                nz
            )));
        }

        let mut result = Ok(());
        if buf.next >= buf.first + buf.held {
            buf.first = buf.next;
            buf.held = buf.chunk.min(nz - buf.first);
            buf.data.resize(slice_len * buf.held, 0.0);
            let start = [0, 0, buf.first];
            let count = [open.dims[0], open.dims[1], buf.held];
            result = self.backend.read(&start, &count, &mut buf.data);
            if result.is_err() {
                buf.held = 0;
            }
        }
        if result.is_ok() {
            let offset = (buf.next - buf.first) * slice_len;
            out[..slice_len].copy_from_slice(&buf.data[offset..offset + slice_len]);
            buf.next += 1;
        }
        self.open = Some(open);
        result
    }

    fn spatial_len(&self, var: &str, level: i32) -> Result<usize> {
        let (dims, _) = self.backend.dim_lens_at_level(&self.catalog, var, level)?;
        Ok(vproduct(&dims))
    }

    /// Write one timestep of a whole variable
    pub fn put_var_ts(&mut self, ts: usize, var: &str, lod: i32, data: &[f32]) -> Result<()> {
        self.open_variable_write(ts, var, lod)?;
        let open = self.open_for(true)?;
        let (start, count) = (vec![0; open.dims.len()], open.dims.clone());
        let written = self.write(&start, &count, data);
        let closed = self.close_variable();
        written.and(closed)
    }

    /// Write every timestep of a variable from one buffer
    pub fn put_var(&mut self, var: &str, lod: i32, data: &[f32]) -> Result<()> {
        let nts = self
            .catalog
            .num_time_steps(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let n = self.spatial_len(var, -1)?;
        if data.len() < n * nts {
            return Err(VdcError::InvalidHyperslab(format!(
                "{}: buffer of {} values for {} timesteps of {}",
                var,
                data.len(),
                nts,
                n
            )));
        }
        for ts in 0..nts {
            self.put_var_ts(ts, var, lod, &data[ts * n..(ts + 1) * n])?;
        }
        Ok(())
    }

    /// Read one timestep of a whole variable
    pub fn get_var_ts(
        &mut self,
        ts: usize,
        var: &str,
        level: i32,
        lod: i32,
        out: &mut [f32],
    ) -> Result<()> {
        self.open_variable_read(ts, var, level, lod)?;
        let open = self.open_for(false)?;
        let (start, count) = (vec![0; open.dims.len()], open.dims.clone());
        let read = self.read(&start, &count, out);
        let closed = self.close_variable();
        read.and(closed)
    }

    /// Read every timestep of a variable into one buffer
    pub fn get_var(&mut self, var: &str, level: i32, lod: i32, out: &mut [f32]) -> Result<()> {
        let nts = self
            .catalog
            .num_time_steps(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let nlevels = self
            .catalog
            .num_ref_levels(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let level = if level < 0 { nlevels as i32 - 1 } else { level };
        let n = self.spatial_len(var, level)?;
        if out.len() < n * nts {
            return Err(VdcError::InvalidHyperslab(format!(
                "{}: buffer of {} values for {} timesteps of {}",
                var,
                out.len(),
                nts,
                n
            )));
        }
        for ts in 0..nts {
            self.get_var_ts(ts, var, level, lod, &mut out[ts * n..(ts + 1) * n])?;
        }
        Ok(())
    }

    /// Close the open variable and release storage
    pub fn close(mut self) -> Result<()> {
        let closed = self.close_variable();
        closed.and(self.backend.close())
    }
}

impl<B: VdcBackend> std::fmt::Debug for Vdc<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdc")
            .field("mode", &self.mode)
            .field("define_mode", &self.define_mode)
            .field("open", &self.open.as_ref().map(|o| &o.var))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CompressionParams;
    use tempfile::TempDir;

    fn config() -> VdcConfig {
        VdcConfig::default().with_nthreads(2).with_compression(CompressionParams::new(
            vec![16, 16, 16],
            "bior2.2",
            vec![8, 1],
        ))
    }

    fn create(dir: &TempDir) -> Vdc {
        Vdc::initialize_with_config(dir.path().join("c.nc"), AccessMode::Write, config()).unwrap()
    }

    #[test]
    fn test_define_mode_gates_operations() {
        let dir = TempDir::new().unwrap();
        let mut vdc = create(&dir);
        vdc.define_dimension("x", 20, Axis::X).unwrap();
        assert!(matches!(
            vdc.open_variable_write(0, "x", -1),
            Err(VdcError::InvalidState(_))
        ));

        vdc.end_define().unwrap();
        assert!(matches!(
            vdc.define_dimension("y", 10, Axis::Y),
            Err(VdcError::NotDefineMode(_))
        ));
        assert!(vdc.put_att(None, "title", XType::Text, "late").is_err());

        let mut x = vec![0.0; 20];
        vdc.get_var("x", -1, -1, &mut x).unwrap();
        assert_eq!(x[19], 19.0);
    }

    #[test]
    fn test_failed_dimension_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let mut vdc = create(&dir);
        vdc.define_dimension("x", 20, Axis::X).unwrap();
        vdc.define_coord_var(CoordVarDef::new("lon", &["x"], Axis::X).units("m$"))
            .unwrap_err();
        assert!(vdc.catalog().coord_var("lon").is_none());
        assert!(vdc.define_dimension("bad", 0, Axis::Y).is_err());
        assert!(vdc.catalog().get_dimension("bad").is_none());
    }

    #[test]
    fn test_slices_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut vdc = create(&dir);
        vdc.define_dimension("x", 20, Axis::X).unwrap();
        vdc.define_dimension("y", 18, Axis::Y).unwrap();
        vdc.define_dimension("z", 20, Axis::Z).unwrap();
        vdc.define_data_var(
            DataVarDef::new("p", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
        )
        .unwrap();
        vdc.end_define().unwrap();

        let slice_len = 20 * 18;
        let slice = |z: usize| -> Vec<f32> {
            (0..slice_len)
                .map(|i| ((i % 20) as f32 * 0.3).sin() + z as f32 * 0.1)
                .collect()
        };

        vdc.open_variable_write(0, "p", -1).unwrap();
        for z in 0..20 {
            vdc.write_slice(&slice(z)).unwrap();
        }
        assert!(vdc.write_slice(&slice(0)).is_err());
        vdc.close_variable().unwrap();

        vdc.open_variable_read(0, "p", -1, -1).unwrap();
        let mut out = vec![0.0; slice_len];
        for z in 0..20 {
            vdc.read_slice(&mut out).unwrap();
            for (a, b) in out.iter().zip(slice(z)) {
                assert!((a - b).abs() < 1e-3);
            }
        }
        vdc.close_variable().unwrap();
    }

    #[test]
    fn test_put_var_checks_buffer() {
        let dir = TempDir::new().unwrap();
        let mut vdc = create(&dir);
        vdc.define_dimension("x", 8, Axis::X).unwrap();
        vdc.define_dimension("t", 3, Axis::T).unwrap();
        vdc.define_data_var(DataVarDef::new("h", &["x", "t"], &["x", "t"]))
            .unwrap();
        vdc.end_define().unwrap();

        assert!(vdc.put_var("h", -1, &[0.0; 10]).is_err());
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        vdc.put_var("h", -1, &data).unwrap();

        let mut out = vec![0.0; 24];
        vdc.get_var("h", -1, -1, &mut out).unwrap();
        assert_eq!(out, data);
        assert!(vdc.open_variable_read(3, "h", -1, -1).is_err());
    }
}
