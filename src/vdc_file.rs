//! Container-file placement for a collection.
//!
//! The master file carries the catalog as `VDC.*` global attributes along
//! with every small uncompressed variable. Everything else lives in a WASP
//! file set of its own under `<stem>_data/{coordinates,data}/<var>/`, with
//! timesteps grouped so that a file holds at most the variable threshold of
//! grid points.
//!
//! Shapes cross into WASP slowest axis first, the reverse of the catalog.

use crate::attribute::Attribute;
use crate::catalog::{Catalog, CoordVar, DataVar, Dimension, VarBase};
use crate::config::VdcConfig;
use crate::error::{Result, VdcError};
use crate::io::{FileSystemIoManager, IoManager};
use crate::layout::{for_each_run, vproduct};
use crate::types::{AccessMode, Axis, XType};
use crate::vdc::{VarPath, VdcBackend};
use crate::wasp::{dims_at_level, mkmultipaths, WaspFile, WaspOptions, WaspVarParams};
use chrono::{DateTime, Utc};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Version of the master file metadata layout
pub const VDC_VERSION: i32 = 1;

const KEY_VERSION: &str = "VDC.Version";
const KEY_DATASET_ID: &str = "VDC.DatasetId";
const KEY_CREATION_TIME: &str = "VDC.CreationTime";
const KEY_MASTER_THRESHOLD: &str = "VDC.MasterThreshold";
const KEY_VARIABLE_THRESHOLD: &str = "VDC.VariableThreshold";
const KEY_DIMENSION_NAMES: &str = "VDC.DimensionNames";
const KEY_COORD_VAR_NAMES: &str = "VDC.CoordVarNames";
const KEY_DATA_VAR_NAMES: &str = "VDC.DataVarNames";

fn put_text(w: &WaspFile, key: &str, value: &str) -> Result<()> {
    w.put_att(None, Attribute::new(key, XType::Text, value))
}

fn put_ints(w: &WaspFile, key: &str, xtype: XType, values: Vec<i64>) -> Result<()> {
    w.put_att(None, Attribute::new(key, xtype, values))
}

fn get_meta(w: &WaspFile, key: &str) -> Result<Attribute> {
    w.get_att(None, key)
        .ok_or_else(|| VdcError::InvalidFormat(format!("{} lacks {}", w.path(), key)))
}

fn get_text(w: &WaspFile, key: &str) -> Result<String> {
    Ok(get_meta(w, key)?.as_text())
}

fn get_ints(w: &WaspFile, key: &str) -> Result<Vec<i64>> {
    Ok(get_meta(w, key)?.as_i64())
}

fn get_int(w: &WaspFile, key: &str) -> Result<i64> {
    get_ints(w, key)?
        .first()
        .copied()
        .ok_or_else(|| VdcError::InvalidFormat(format!("{} is empty in {}", key, w.path())))
}

fn name_list(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Negative selects the finest level of detail; past the end clamps to it
fn clamp_lod(lod: i32, nlod: usize) -> usize {
    let finest = nlod.saturating_sub(1);
    if lod < 0 {
        finest
    } else {
        (lod as usize).min(finest)
    }
}

fn lod_path(lod0: &str, lod: usize) -> String {
    mkmultipaths(lod0, lod + 1).remove(lod)
}

fn reversed<T: Clone>(v: &[T]) -> Vec<T> {
    v.iter().rev().cloned().collect()
}

/// Where one timestep of a variable is stored
#[derive(Debug, Clone)]
struct Location {
    /// The variable's file, or for compressed variables its first
    /// level-of-detail file
    rel: String,
    in_master: bool,
    file_ts: usize,
    max_ts: usize,
    nts_in_file: usize,
}

enum Storage {
    Master,
    Side(WaspFile),
}

struct OpenInfo {
    name: String,
    time_varying: bool,
    blocked: bool,
    write: bool,
    file_ts: usize,
    /// Spatial dims at the open level, slowest first
    dims: Vec<usize>,
    mask: Option<Vec<bool>>,
    missing_value: f32,
}

impl OpenInfo {
    /// Storage hyperslab for a spatial, X-first one
    fn slab(&self, start: &[usize], count: &[usize]) -> (Vec<usize>, Vec<usize>) {
        let mut s = reversed(start);
        let mut c = reversed(count);
        if self.time_varying {
            s.insert(0, self.file_ts);
            c.insert(0, 1);
        }
        (s, c)
    }

    fn mask_for(&self, start: &[usize], count: &[usize]) -> Option<Vec<bool>> {
        self.mask
            .as_ref()
            .map(|m| sub_mask(m, &self.dims, &reversed(start), &reversed(count)))
    }

    fn apply_mask(&self, start: &[usize], count: &[usize], out: &mut [f32]) {
        if let Some(keep) = self.mask_for(start, count) {
            for (v, k) in out.iter_mut().zip(keep) {
                if !k {
                    *v = self.missing_value;
                }
            }
        }
    }
}

struct OpenVariable {
    storage: Storage,
    info: OpenInfo,
}

fn sub_mask(mask: &[bool], dims: &[usize], start: &[usize], count: &[usize]) -> Vec<bool> {
    let mut out = vec![false; vproduct(count)];
    for_each_run(dims, start, count, |at, to, len| {
        out[to..to + len].copy_from_slice(&mask[at..at + len]);
    });
    out
}

/// Nearest-neighbour resampling of a native-grid mask onto a coarser grid
fn resample_mask(mask: &[bool], native: &[usize], dims: &[usize]) -> Result<Vec<bool>> {
    let view = ArrayViewD::from_shape(IxDyn(native), mask)
        .map_err(|e| VdcError::InvalidArgument(format!("mask shape: {}", e)))?;
    let resampled = ArrayD::from_shape_fn(IxDyn(dims), |idx| {
        let src: Vec<usize> = (0..dims.len())
            .map(|i| (idx[i] * native[i] / dims[i]).min(native[i] - 1))
            .collect();
        view[IxDyn(&src)]
    });
    Ok(resampled.iter().copied().collect())
}

/// Collection storage in container files
pub struct VdcFile {
    io: Arc<dyn IoManager>,
    master_name: String,
    options: WaspOptions,
    master_threshold: usize,
    variable_threshold: usize,
    dataset_id: Uuid,
    created: DateTime<Utc>,
    master: Option<WaspFile>,
    open: Option<OpenVariable>,
}

impl VdcFile {
    /// Storage for the collection whose master file is `path`; variable
    /// files go next to it
    pub fn new(path: &Path, config: VdcConfig) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VdcError::InvalidArgument(format!("invalid master path {}", path.display()))
            })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(Self::with_io(
            Arc::new(FileSystemIoManager::new(dir)),
            name,
            config,
        ))
    }

    pub fn with_io(io: Arc<dyn IoManager>, master_name: &str, config: VdcConfig) -> Self {
        Self {
            io,
            master_name: master_name.to_string(),
            options: config.wasp_options(),
            master_threshold: config.master_threshold,
            variable_threshold: config.variable_threshold,
            dataset_id: Uuid::new_v4(),
            created: Utc::now(),
            master: None,
            open: None,
        }
    }

    pub fn dataset_id(&self) -> Uuid {
        self.dataset_id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn master_threshold(&self) -> usize {
        self.master_threshold
    }

    pub fn variable_threshold(&self) -> usize {
        self.variable_threshold
    }

    fn stem(&self) -> &str {
        self.master_name
            .strip_suffix(".nc")
            .unwrap_or(&self.master_name)
    }

    fn in_master(&self, var: &VarBase) -> bool {
        !var.is_compressed()
            && vproduct(&var.dim_lens()) * var.xtype.size_in_bytes() < self.master_threshold
    }

    fn locate(&self, catalog: &Catalog, var: &str, ts: usize) -> Result<Location> {
        let vb = catalog
            .base_var(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let numts = vb.num_time_steps();
        if ts >= numts {
            return Err(VdcError::InvalidArgument(format!(
                "{}: timestep {} of {}",
                var, ts, numts
            )));
        }

        if self.in_master(vb) {
            return Ok(Location {
                rel: self.master_name.clone(),
                in_master: true,
                file_ts: ts,
                max_ts: numts,
                nts_in_file: numts,
            });
        }

        let group = if catalog.is_coord_var(var) {
            "coordinates"
        } else {
            "data"
        };
        let dir = format!("{}_data/{}/{}", self.stem(), group, var);
        let lod0 = if vb.is_compressed() { "0" } else { "" };
        if !vb.is_time_varying() {
            return Ok(Location {
                rel: format!("{}/{}.nc{}", dir, var, lod0),
                in_master: false,
                file_ts: 0,
                max_ts: 1,
                nts_in_file: 1,
            });
        }

        let npoints = vproduct(&vb.spatial_dimensions().iter().map(|d| d.length).collect::<Vec<_>>());
        let max_ts = (self.variable_threshold / npoints.max(1)).max(1);
        let index = ts / max_ts;
        let width = (numts - 1).to_string().len().max(4);
        Ok(Location {
            rel: format!("{}/{}.{:0width$}.nc{}", dir, var, index, lod0, width = width),
            in_master: false,
            file_ts: ts % max_ts,
            max_ts,
            nts_in_file: max_ts.min(numts - index * max_ts),
        })
    }

    fn wasp_params(var: &VarBase, missing_value: Option<f64>) -> Option<WaspVarParams> {
        if var.is_compressed() {
            let nspatial = var.spatial_dimensions().len();
            Some(WaspVarParams {
                wname: var.wname.clone(),
                bs: reversed(&var.bs[..nspatial]),
                cratios: var.cratios.clone(),
                missing_value,
            })
        } else {
            missing_value.map(|mv| WaspVarParams {
                missing_value: Some(mv),
                ..Default::default()
            })
        }
    }

    fn owns(&self, w: &WaspFile) -> bool {
        w.get_att(None, KEY_DATASET_ID)
            .is_some_and(|a| a.as_text() == self.dataset_id.to_string())
    }

    fn master_ref(master: &mut Option<WaspFile>) -> Result<&mut WaspFile> {
        master
            .as_mut()
            .ok_or_else(|| VdcError::InvalidState("master file is not open".to_string()))
    }

    fn wasp<'a>(
        storage: &'a mut Storage,
        master: &'a mut Option<WaspFile>,
    ) -> Result<&'a mut WaspFile> {
        match storage {
            Storage::Side(w) => Ok(w),
            Storage::Master => Self::master_ref(master),
        }
    }

    fn create_side(&self, catalog: &Catalog, vb: &VarBase, loc: &Location) -> Result<WaspFile> {
        if self.io.exists(&loc.rel) {
            match WaspFile::open(self.io.clone(), &loc.rel, true, &self.options) {
                Ok(w) if self.owns(&w) && w.has_var(&vb.name) => return Ok(w),
                Ok(_) => warn!(path = %loc.rel, "replacing file from another collection"),
                Err(e) => warn!(path = %loc.rel, error = %e, "replacing unreadable file"),
            }
        }

        let numfiles = if vb.is_compressed() {
            vb.cratios.len()
        } else {
            1
        };
        let w = WaspFile::create(self.io.clone(), &loc.rel, numfiles, &self.options)?;
        put_text(&w, KEY_DATASET_ID, &self.dataset_id.to_string())?;

        let mut dim_names = Vec::with_capacity(vb.dimensions.len());
        if let Some(t) = vb.dimensions.last().filter(|d| d.axis.is_time()) {
            w.def_dim(&t.name, loc.nts_in_file)?;
            dim_names.push(t.name.clone());
        }
        for d in vb.spatial_dimensions().iter().rev() {
            w.def_dim(&d.name, d.length)?;
            dim_names.push(d.name.clone());
        }
        let missing = catalog.data_var(&vb.name).and_then(|d| d.missing_value);
        w.def_var(
            &vb.name,
            vb.xtype,
            &dim_names,
            Self::wasp_params(vb, missing).as_ref(),
        )?;
        debug!(path = %loc.rel, var = %vb.name, numfiles, "created variable file");
        Ok(w)
    }

    fn open_side(&self, loc: &Location) -> Result<WaspFile> {
        let w = WaspFile::open(self.io.clone(), &loc.rel, false, &self.options)?;
        if !self.owns(&w) {
            return Err(VdcError::InvalidFormat(format!(
                "{} belongs to another collection",
                loc.rel
            )));
        }
        Ok(w)
    }

    fn open_storage(
        &self,
        catalog: &Catalog,
        ts: usize,
        var: &str,
        write: bool,
    ) -> Result<(Storage, Location)> {
        let vb = catalog
            .base_var(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let loc = self.locate(catalog, var, ts)?;
        if loc.in_master {
            if self.master.is_none() {
                return Err(VdcError::InvalidState("master file is not open".to_string()));
            }
            return Ok((Storage::Master, loc));
        }
        let side = if write {
            self.create_side(catalog, vb, &loc)?
        } else {
            self.open_side(&loc)?
        };
        Ok((Storage::Side(side), loc))
    }

    /// Native-grid mask for timestep `ts`, with its dims slowest first. A
    /// point is valid where the mask value rounds to nonzero.
    fn read_mask(
        &mut self,
        catalog: &Catalog,
        mask_var: &str,
        ts: usize,
    ) -> Result<(Vec<bool>, Vec<usize>)> {
        let time_varying = catalog.is_time_varying(mask_var);
        let ts = if time_varying { ts } else { 0 };
        let (mut storage, loc) = self.open_storage(catalog, ts, mask_var, false)?;
        let wasp = Self::wasp(&mut storage, &mut self.master)?;

        wasp.open_var_read(mask_var, -1, -1)?;
        let (dims, _) = wasp.inq_var_dimlens(mask_var, -1)?;
        let mut start = vec![0; dims.len()];
        let mut count = dims.clone();
        let spatial = if time_varying {
            start[0] = loc.file_ts;
            count[0] = 1;
            dims[1..].to_vec()
        } else {
            dims
        };
        let mut values = vec![0.0; vproduct(&count)];
        let read = wasp.get_vara(&start, &count, &mut values);
        wasp.close_var()?;
        read?;
        Ok((values.iter().map(|&v| v.round() != 0.0).collect(), spatial))
    }

    fn open_var(
        &mut self,
        catalog: &Catalog,
        ts: usize,
        var: &str,
        level: i32,
        lod: i32,
        write: bool,
    ) -> Result<()> {
        self.close_var()?;
        let vb = catalog
            .base_var(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let dv = catalog.data_var(var);
        let mask = match dv.and_then(|d| d.mask_var.as_deref()) {
            Some(m) => Some(self.read_mask(catalog, m, ts)?),
            None => None,
        };

        let (mut storage, loc) = self.open_storage(catalog, ts, var, write)?;
        let wasp = Self::wasp(&mut storage, &mut self.master)?;
        if write {
            wasp.open_var_write(var, lod)?;
        } else {
            wasp.open_var_read(var, level, lod)?;
        }
        let (mut dims, _) = wasp.inq_var_dimlens(var, if write { -1 } else { level })?;
        if vb.is_time_varying() {
            dims.remove(0);
        }

        let mask = match mask {
            Some((m, native)) if native == dims => Some(m),
            Some((m, native)) => Some(resample_mask(&m, &native, &dims)?),
            None => None,
        };
        debug!(var, ts, path = %loc.rel, file_ts = loc.file_ts, write, "opened variable storage");
        self.open = Some(OpenVariable {
            storage,
            info: OpenInfo {
                name: var.to_string(),
                time_varying: vb.is_time_varying(),
                blocked: vb.is_compressed(),
                write,
                file_ts: loc.file_ts,
                dims,
                mask,
                missing_value: dv.and_then(|d| d.missing_value).unwrap_or(0.0) as f32,
            },
        });
        Ok(())
    }

    fn open_parts(&mut self) -> Result<(&mut WaspFile, &OpenInfo)> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| VdcError::InvalidState("no variable is open".to_string()))?;
        let wasp = Self::wasp(&mut open.storage, &mut self.master)?;
        Ok((wasp, &open.info))
    }

    fn write_master_vars(master: &WaspFile, catalog: &Catalog, resident: &[&VarBase]) -> Result<()> {
        for d in catalog.dimensions.values() {
            if master.inq_dim(&d.name).is_none() {
                master.def_dim(&d.name, d.length)?;
            }
        }
        for vb in resident {
            if master.has_var(&vb.name) {
                continue;
            }
            let missing = catalog.data_var(&vb.name).and_then(|d| d.missing_value);
            master.def_var(
                &vb.name,
                vb.xtype,
                &reversed(&vb.dim_names()),
                Self::wasp_params(vb, missing).as_ref(),
            )?;
        }
        Ok(())
    }

    fn write_meta(&self, master: &WaspFile, catalog: &Catalog) -> Result<()> {
        put_ints(master, KEY_VERSION, XType::Int32, vec![VDC_VERSION as i64])?;
        put_text(master, KEY_DATASET_ID, &self.dataset_id.to_string())?;
        put_text(master, KEY_CREATION_TIME, &self.created.to_rfc3339())?;
        put_ints(
            master,
            KEY_MASTER_THRESHOLD,
            XType::Int64,
            vec![self.master_threshold as i64],
        )?;
        put_ints(
            master,
            KEY_VARIABLE_THRESHOLD,
            XType::Int64,
            vec![self.variable_threshold as i64],
        )?;

        put_text(
            master,
            KEY_DIMENSION_NAMES,
            &catalog.dimension_names().join(" "),
        )?;
        for d in catalog.dimensions.values() {
            let prefix = format!("VDC.Dimension.{}", d.name);
            put_ints(
                master,
                &format!("{}.Length", prefix),
                XType::Int64,
                vec![d.length as i64],
            )?;
            put_ints(
                master,
                &format!("{}.Axis", prefix),
                XType::Int32,
                vec![d.axis.to_index() as i64],
            )?;
        }

        write_atts(master, "VDC", &catalog.atts)?;

        let coord_names: Vec<&str> = catalog.coord_vars.keys().map(String::as_str).collect();
        put_text(master, KEY_COORD_VAR_NAMES, &coord_names.join(" "))?;
        for c in catalog.coord_vars.values() {
            let prefix = format!("VDC.CoordVar.{}", c.base.name);
            put_ints(
                master,
                &format!("{}.Axis", prefix),
                XType::Int32,
                vec![c.axis.to_index() as i64],
            )?;
            put_ints(
                master,
                &format!("{}.Uniform", prefix),
                XType::Int32,
                vec![c.uniform as i64],
            )?;
            write_base(master, &prefix, &c.base)?;
        }

        let data_names: Vec<&str> = catalog.data_vars.keys().map(String::as_str).collect();
        put_text(master, KEY_DATA_VAR_NAMES, &data_names.join(" "))?;
        for d in catalog.data_vars.values() {
            let prefix = format!("VDC.DataVar.{}", d.base.name);
            put_text(master, &format!("{}.CoordVars", prefix), &d.coord_vars.join(" "))?;
            put_ints(
                master,
                &format!("{}.HasMissing", prefix),
                XType::Int32,
                vec![d.missing_value.is_some() as i64],
            )?;
            master.put_att(
                None,
                Attribute::new(
                    format!("{}.MissingValue", prefix),
                    XType::Double,
                    vec![d.missing_value.unwrap_or(0.0)],
                ),
            )?;
            put_text(
                master,
                &format!("{}.MaskVar", prefix),
                d.mask_var.as_deref().unwrap_or(""),
            )?;
            write_base(master, &prefix, &d.base)?;
        }
        Ok(())
    }

    fn read_meta(&mut self, master: &WaspFile) -> Result<Catalog> {
        let version = get_int(master, KEY_VERSION)?;
        if version != VDC_VERSION as i64 {
            return Err(VdcError::UnsupportedVersion(version as u32));
        }
        self.dataset_id = Uuid::parse_str(&get_text(master, KEY_DATASET_ID)?)
            .map_err(|e| VdcError::InvalidFormat(format!("dataset id: {}", e)))?;
        self.created = DateTime::parse_from_rfc3339(&get_text(master, KEY_CREATION_TIME)?)
            .map_err(|e| VdcError::InvalidFormat(format!("creation time: {}", e)))?
            .with_timezone(&Utc);
        self.master_threshold = get_int(master, KEY_MASTER_THRESHOLD)? as usize;
        self.variable_threshold = (get_int(master, KEY_VARIABLE_THRESHOLD)? as usize).max(1);

        let mut catalog = Catalog::new();
        for name in name_list(&get_text(master, KEY_DIMENSION_NAMES)?) {
            let prefix = format!("VDC.Dimension.{}", name);
            let length = get_int(master, &format!("{}.Length", prefix))? as usize;
            let axis = read_axis(master, &format!("{}.Axis", prefix))?;
            catalog
                .dimensions
                .insert(name.clone(), Dimension::new(name, length, axis));
        }

        catalog.atts = read_atts(master, "VDC")?;

        for name in name_list(&get_text(master, KEY_COORD_VAR_NAMES)?) {
            let prefix = format!("VDC.CoordVar.{}", name);
            let cvar = CoordVar {
                axis: read_axis(master, &format!("{}.Axis", prefix))?,
                uniform: get_int(master, &format!("{}.Uniform", prefix))? != 0,
                base: read_base(master, &prefix, &name, &catalog)?,
            };
            catalog.coord_vars.insert(name, cvar);
        }

        for name in name_list(&get_text(master, KEY_DATA_VAR_NAMES)?) {
            let prefix = format!("VDC.DataVar.{}", name);
            let has_missing = get_int(master, &format!("{}.HasMissing", prefix))? != 0;
            let missing = get_meta(master, &format!("{}.MissingValue", prefix))?
                .as_f64()
                .first()
                .copied();
            let mask = get_text(master, &format!("{}.MaskVar", prefix))?;
            let dvar = DataVar {
                coord_vars: name_list(&get_text(master, &format!("{}.CoordVars", prefix))?),
                missing_value: if has_missing { missing } else { None },
                mask_var: Some(mask).filter(|m| !m.is_empty()),
                base: read_base(master, &prefix, &name, &catalog)?,
            };
            catalog.data_vars.insert(name, dvar);
        }
        Ok(catalog)
    }
}

fn write_atts(w: &WaspFile, prefix: &str, atts: &BTreeMap<String, Attribute>) -> Result<()> {
    let names: Vec<&str> = atts.keys().map(String::as_str).collect();
    put_text(w, &format!("{}.AttributeNames", prefix), &names.join(" "))?;
    for att in atts.values() {
        w.put_att(
            None,
            Attribute::from_values(
                format!("{}.Attribute.{}", prefix, att.name()),
                att.values().clone(),
            ),
        )?;
    }
    Ok(())
}

fn read_atts(w: &WaspFile, prefix: &str) -> Result<BTreeMap<String, Attribute>> {
    let mut atts = BTreeMap::new();
    for name in name_list(&get_text(w, &format!("{}.AttributeNames", prefix))?) {
        let stored = get_meta(w, &format!("{}.Attribute.{}", prefix, name))?;
        atts.insert(
            name.clone(),
            Attribute::from_values(name, stored.values().clone()),
        );
    }
    Ok(atts)
}

fn read_axis(w: &WaspFile, key: &str) -> Result<Axis> {
    let index = get_int(w, key)?;
    Axis::from_index(index as usize)
        .ok_or_else(|| VdcError::InvalidFormat(format!("{}: bad axis {}", key, index)))
}

fn write_base(w: &WaspFile, prefix: &str, var: &VarBase) -> Result<()> {
    let key = |k: &str| format!("{}.{}", prefix, k);
    let ints = |v: &[usize]| v.iter().map(|&x| x as i64).collect::<Vec<_>>();

    put_text(w, &key("DimensionNames"), &var.dim_names().join(" "))?;
    put_text(w, &key("Units"), &var.units)?;
    put_text(w, &key("XType"), var.xtype.name())?;
    put_ints(w, &key("BlockSize"), XType::Int64, ints(&var.bs))?;
    put_text(w, &key("WaveName"), &var.wname)?;
    put_ints(w, &key("CompressionRatios"), XType::Int64, ints(&var.cratios))?;
    put_ints(
        w,
        &key("Periodic"),
        XType::Int32,
        var.periodic.iter().map(|&p| p as i64).collect(),
    )?;
    write_atts(w, prefix, &var.atts)
}

fn read_base(w: &WaspFile, prefix: &str, name: &str, catalog: &Catalog) -> Result<VarBase> {
    let key = |k: &str| format!("{}.{}", prefix, k);
    let usizes = |v: Vec<i64>| v.into_iter().map(|x| x as usize).collect::<Vec<_>>();

    let mut dimensions = Vec::new();
    for d in name_list(&get_text(w, &key("DimensionNames"))?) {
        let dim = catalog.get_dimension(&d).cloned().ok_or_else(|| {
            VdcError::InvalidFormat(format!("{}: unknown dimension {}", name, d))
        })?;
        dimensions.push(dim);
    }
    let xtype_name = get_text(w, &key("XType"))?;
    let xtype = XType::from_name(&xtype_name).ok_or_else(|| {
        VdcError::InvalidFormat(format!("{}: unknown type {}", name, xtype_name))
    })?;

    Ok(VarBase {
        name: name.to_string(),
        dimensions,
        units: get_text(w, &key("Units"))?,
        xtype,
        bs: usizes(get_ints(w, &key("BlockSize"))?),
        wname: get_text(w, &key("WaveName"))?,
        cratios: usizes(get_ints(w, &key("CompressionRatios"))?),
        periodic: get_ints(w, &key("Periodic"))?
            .into_iter()
            .map(|p| p != 0)
            .collect(),
        atts: read_atts(w, prefix)?,
    })
}

impl VdcBackend for VdcFile {
    fn initialize(&mut self, mode: AccessMode) -> Result<Option<Catalog>> {
        if mode == AccessMode::Write {
            info!(master = %self.master_name, "creating collection");
            return Ok(None);
        }
        let master = WaspFile::open(
            self.io.clone(),
            &self.master_name,
            mode == AccessMode::Append,
            &self.options,
        )?;
        let catalog = self.read_meta(&master)?;
        self.master = Some(master);
        info!(
            master = %self.master_name,
            dataset = %self.dataset_id,
            ?mode,
            "opened collection"
        );
        Ok(Some(catalog))
    }

    fn write_master_meta(&mut self, catalog: &Catalog) -> Result<()> {
        let mut master = match self.master.take() {
            Some(m) => m,
            None => WaspFile::create(self.io.clone(), &self.master_name, 1, &self.options)?,
        };
        let resident: Vec<&VarBase> = catalog
            .coord_vars
            .values()
            .map(|c| &c.base)
            .chain(catalog.data_vars.values().map(|d| &d.base))
            .filter(|v| self.in_master(v))
            .collect();

        let result = self
            .write_meta(&master, catalog)
            .and_then(|_| Self::write_master_vars(&master, catalog, &resident))
            .and_then(|_| master.sync());
        self.master = Some(master);
        debug!(master = %self.master_name, resident = resident.len(), "wrote master metadata");
        result
    }

    fn get_path(&self, catalog: &Catalog, var: &str, ts: usize, lod: i32) -> Result<VarPath> {
        let loc = self.locate(catalog, var, ts)?;
        let rel = match catalog.base_var(var) {
            Some(vb) if vb.is_compressed() && !loc.in_master => {
                lod_path(&loc.rel, clamp_lod(lod, vb.cratios.len()))
            }
            _ => loc.rel,
        };
        Ok(VarPath {
            path: self.io.resolve(&rel),
            file_ts: loc.file_ts,
            max_ts: loc.max_ts,
        })
    }

    fn dim_lens_at_level(
        &self,
        catalog: &Catalog,
        var: &str,
        level: i32,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        let vb = catalog
            .base_var(var)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", var)))?;
        let spatial = vb.spatial_dimensions();
        let dims: Vec<usize> = spatial.iter().map(|d| d.length).collect();

        if !vb.is_compressed() {
            if level > 0 {
                return Err(VdcError::InvalidArgument(format!(
                    "{}: refinement level {} of an uncompressed variable",
                    var, level
                )));
            }
            let bs = vec![1; dims.len()];
            return Ok((dims, bs));
        }
        let bs = &vb.bs[..spatial.len()];
        let (d, b) = dims_at_level(&reversed(&dims), &reversed(bs), &vb.wname, &vb.cratios, level)?;
        Ok((reversed(&d), reversed(&b)))
    }

    fn variable_exists(
        &self,
        catalog: &Catalog,
        ts: usize,
        var: &str,
        level: i32,
        lod: i32,
    ) -> bool {
        let vb = match catalog.base_var(var) {
            Some(vb) => vb,
            None => return false,
        };
        if level >= 0 && level as usize >= vb.num_ref_levels() {
            return false;
        }
        let loc = match self.locate(catalog, var, ts) {
            Ok(loc) => loc,
            Err(_) => return false,
        };
        if loc.in_master {
            return self.master.as_ref().is_some_and(|m| m.has_var(var));
        }
        if !vb.is_compressed() {
            return self.io.exists(&loc.rel);
        }
        let path = lod_path(&loc.rel, clamp_lod(lod, vb.cratios.len()));
        self.io.exists(&path)
    }

    fn open_var_write(&mut self, catalog: &Catalog, ts: usize, var: &str, lod: i32) -> Result<()> {
        self.open_var(catalog, ts, var, -1, lod, true)
    }

    fn open_var_read(
        &mut self,
        catalog: &Catalog,
        ts: usize,
        var: &str,
        level: i32,
        lod: i32,
    ) -> Result<()> {
        self.open_var(catalog, ts, var, level, lod, false)
    }

    fn close_var(&mut self) -> Result<()> {
        let open = match self.open.take() {
            Some(o) => o,
            None => return Ok(()),
        };
        debug!(var = %open.info.name, "closed variable storage");
        match open.storage {
            Storage::Side(mut w) => {
                w.close_var()?;
                w.close()
            }
            Storage::Master => {
                let master = Self::master_ref(&mut self.master)?;
                master.close_var()?;
                if open.info.write {
                    master.sync()?;
                }
                Ok(())
            }
        }
    }

    fn write(&mut self, start: &[usize], count: &[usize], data: &[f32]) -> Result<()> {
        let (wasp, info) = self.open_parts()?;
        if !info.write {
            return Err(VdcError::InvalidState(format!(
                "{} is open for reading",
                info.name
            )));
        }
        let (s, c) = info.slab(start, count);
        let mask = info.mask_for(start, count);
        wasp.put_vara(&s, &c, data, mask.as_deref())
    }

    fn read(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()> {
        let (wasp, info) = self.open_parts()?;
        let (s, c) = info.slab(start, count);
        wasp.get_vara(&s, &c, out)?;
        info.apply_mask(start, count, out);
        Ok(())
    }

    fn read_region(&mut self, start: &[usize], count: &[usize], out: &mut [f32]) -> Result<()> {
        let (wasp, info) = self.open_parts()?;
        let (s, c) = info.slab(start, count);
        wasp.get_vara_region(&s, &c, out)?;
        info.apply_mask(start, count, out);
        Ok(())
    }

    fn read_region_block(
        &mut self,
        start: &[usize],
        count: &[usize],
        out: &mut [f32],
    ) -> Result<()> {
        let (wasp, info) = self.open_parts()?;
        let (s, c) = info.slab(start, count);
        if info.blocked {
            wasp.get_vara_block(&s, &c, out)
        } else {
            // single-point blocks: block order is row-major order
            wasp.get_vara(&s, &c, out)
        }
    }

    fn close(&mut self) -> Result<()> {
        let closed = self.close_var();
        let synced = match self.master.take() {
            Some(master) => master.close(),
            None => Ok(()),
        };
        if closed.is_ok() && synced.is_ok() {
            debug!(master = %self.master_name, "closed collection");
        }
        closed.and(synced)
    }
}

impl Drop for VdcFile {
    fn drop(&mut self) {
        if self.open.is_some() || self.master.is_some() {
            if let Err(e) = self.close() {
                warn!(master = %self.master_name, error = %e, "failed to close collection");
            }
        }
    }
}

impl std::fmt::Debug for VdcFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdcFile")
            .field("master", &self.master_name)
            .field("dataset_id", &self.dataset_id)
            .field("master_threshold", &self.master_threshold)
            .field("variable_threshold", &self.variable_threshold)
            .finish()
    }
}
