//! Schema of a collection: dimensions, coordinate and data variables, and
//! attributes. Pure data and validation; no I/O happens here.
//!
//! Dimension lists are kept fastest-varying first (X, Y, Z, T).

use crate::attribute::Attribute;
use crate::codec::{compression_info, BlockCodec};
use crate::error::{Result, VdcError};
use crate::types::{Axis, XType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of dimensions of any variable
pub const MAX_DIMS: usize = 4;

/// A named, axis-tagged dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub length: usize,
    pub axis: Axis,
}

impl Dimension {
    pub fn new(name: impl Into<String>, length: usize, axis: Axis) -> Self {
        Self {
            name: name.into(),
            length,
            axis,
        }
    }
}

/// Block shape, wavelet, ratio table and periodicity applied to a variable
/// definition. Block shape and periodicity are listed X first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionParams {
    pub bs: Vec<usize>,
    pub wname: String,
    pub cratios: Vec<usize>,
    pub periodic: Vec<bool>,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            bs: vec![64, 64, 64],
            wname: "bior4.4".to_string(),
            cratios: vec![500, 100, 10, 1],
            periodic: vec![false; 3],
        }
    }
}

impl CompressionParams {
    pub fn new(bs: Vec<usize>, wname: impl Into<String>, cratios: Vec<usize>) -> Self {
        Self {
            bs,
            wname: wname.into(),
            cratios,
            ..Default::default()
        }
    }

    pub fn with_periodic(mut self, periodic: Vec<bool>) -> Self {
        self.periodic = periodic;
        self
    }

    /// Check the ratio table against a block shape
    pub fn validate(&self) -> Result<()> {
        if self.bs.is_empty() || self.bs.iter().any(|&b| b == 0) {
            return Err(VdcError::InvalidCompression(format!(
                "invalid block shape {:?}",
                self.bs
            )));
        }
        if self.wname.is_empty() {
            return Ok(());
        }
        let bs: Vec<usize> = self.bs.iter().rev().copied().collect();
        BlockCodec::new(&self.wname, &bs, &self.cratios).map(|_| ())
    }
}

/// State shared by coordinate and data variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarBase {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub units: String,
    pub xtype: XType,
    /// Block shape, one entry per dimension, X first
    pub bs: Vec<usize>,
    /// Wavelet name; empty for uncompressed variables
    pub wname: String,
    pub cratios: Vec<usize>,
    pub periodic: Vec<bool>,
    pub atts: BTreeMap<String, Attribute>,
}

impl VarBase {
    /// A variable is compressed when it has more than one level of detail.
    /// A wavelet with the single ratio `[1]` is stored plain.
    pub fn is_compressed(&self) -> bool {
        self.cratios.len() > 1
    }

    pub fn is_time_varying(&self) -> bool {
        self.dimensions.iter().any(|d| d.axis.is_time())
    }

    pub fn dim_names(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.name.clone()).collect()
    }

    pub fn dim_lens(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.length).collect()
    }

    /// Spatial dimensions only
    pub fn spatial_dimensions(&self) -> &[Dimension] {
        match self.dimensions.last() {
            Some(d) if d.axis.is_time() => &self.dimensions[..self.dimensions.len() - 1],
            _ => &self.dimensions,
        }
    }

    pub fn num_time_steps(&self) -> usize {
        self.dimensions
            .iter()
            .find(|d| d.axis.is_time())
            .map_or(1, |d| d.length)
    }

    /// Block extent along `axis`, or `None` if the variable lacks that axis
    pub fn axis_block_len(&self, axis: Axis) -> Option<usize> {
        self.dimensions
            .iter()
            .position(|d| d.axis == axis)
            .map(|i| self.bs[i])
    }

    /// Number of refinement levels available
    pub fn num_ref_levels(&self) -> usize {
        if !self.is_compressed() {
            return 1;
        }
        let bs: Vec<usize> = self.spatial_bs().iter().rev().copied().collect();
        compression_info(&bs, &self.wname).map_or(1, |(n, _)| n)
    }

    fn spatial_bs(&self) -> &[usize] {
        &self.bs[..self.spatial_dimensions().len()]
    }
}

/// A variable holding coordinates along one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordVar {
    pub base: VarBase,
    pub axis: Axis,
    pub uniform: bool,
}

/// A sampled field referencing coordinate variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVar {
    pub base: VarBase,
    pub coord_vars: Vec<String>,
    pub missing_value: Option<f64>,
    pub mask_var: Option<String>,
}

/// Definition request for a coordinate variable
#[derive(Debug, Clone)]
pub struct CoordVarDef {
    pub name: String,
    pub dim_names: Vec<String>,
    pub axis: Axis,
    pub units: String,
    pub xtype: XType,
    pub compressed: bool,
    pub compression: Option<CompressionParams>,
}

impl CoordVarDef {
    pub fn new(name: impl Into<String>, dim_names: &[&str], axis: Axis) -> Self {
        Self {
            name: name.into(),
            dim_names: dim_names.iter().map(|s| s.to_string()).collect(),
            axis,
            units: String::new(),
            xtype: XType::Float,
            compressed: false,
            compression: None,
        }
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn xtype(mut self, xtype: XType) -> Self {
        self.xtype = xtype;
        self
    }

    /// Compress with the collection's default parameters
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Compress with explicit parameters
    pub fn compression(mut self, params: CompressionParams) -> Self {
        self.compressed = true;
        self.compression = Some(params);
        self
    }
}

/// Definition request for a data variable
#[derive(Debug, Clone)]
pub struct DataVarDef {
    pub name: String,
    pub dim_names: Vec<String>,
    pub coord_vars: Vec<String>,
    pub units: String,
    pub xtype: XType,
    pub compressed: bool,
    pub compression: Option<CompressionParams>,
    pub missing_value: Option<f64>,
    pub mask_var: Option<String>,
}

impl DataVarDef {
    pub fn new(name: impl Into<String>, dim_names: &[&str], coord_vars: &[&str]) -> Self {
        Self {
            name: name.into(),
            dim_names: dim_names.iter().map(|s| s.to_string()).collect(),
            coord_vars: coord_vars.iter().map(|s| s.to_string()).collect(),
            units: String::new(),
            xtype: XType::Float,
            compressed: false,
            compression: None,
            missing_value: None,
            mask_var: None,
        }
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn xtype(mut self, xtype: XType) -> Self {
        self.xtype = xtype;
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn compression(mut self, params: CompressionParams) -> Self {
        self.compressed = true;
        self.compression = Some(params);
        self
    }

    pub fn missing_value(mut self, value: f64) -> Self {
        self.missing_value = Some(value);
        self
    }

    /// Name a data variable whose nonzero values mark valid points
    pub fn mask(mut self, mask_var: impl Into<String>, missing_value: f64) -> Self {
        self.mask_var = Some(mask_var.into());
        self.missing_value = Some(missing_value);
        self
    }
}

/// Block shape for a dimension list: the default extent per position,
/// except 1 along time. A 1-D time-varying variable is never blocked.
pub fn compute_bs(dimensions: &[Dimension], default_bs: &[usize]) -> Vec<usize> {
    if dimensions.len() == 1 && dimensions[0].axis.is_time() {
        return vec![1];
    }
    dimensions
        .iter()
        .enumerate()
        .map(|(i, d)| match default_bs.get(i) {
            Some(&b) if !d.axis.is_time() => b,
            _ => 1,
        })
        .collect()
}

/// Split a dimension list into spatial lengths and a time-step count
pub fn parse_dimensions(dimensions: &[Dimension]) -> Option<(Vec<usize>, usize)> {
    if dimensions.is_empty() || dimensions.len() > MAX_DIMS || !axes_ordered(dimensions) {
        return None;
    }
    let (spatial, numts) = match dimensions.last() {
        Some(d) if d.axis.is_time() => (&dimensions[..dimensions.len() - 1], d.length),
        _ => (dimensions, 1),
    };
    Some((spatial.iter().map(|d| d.length).collect(), numts))
}

fn axes_ordered(dimensions: &[Dimension]) -> bool {
    dimensions.windows(2).all(|w| w[0].axis < w[1].axis)
}

/// Check a units string against a small unit-expression grammar: products
/// and quotients of symbols with optional integer exponents and numeric
/// scale factors, optionally followed by `since <reference>`.
pub fn valid_units(units: &str) -> bool {
    let units = units.trim();
    if units.is_empty() {
        return true;
    }

    let words: Vec<&str> = units.split_whitespace().collect();
    let expr = match words.iter().position(|&w| w == "since") {
        Some(p) => {
            if p + 1 == words.len() {
                return false;
            }
            words[..p].join(" ")
        }
        None => units.to_string(),
    };
    let ops: &[char] = &['/', '*'];
    let expr = expr.trim();
    if expr.is_empty() || expr.starts_with(ops) || expr.ends_with(ops) {
        return false;
    }

    expr.split(|c: char| c.is_whitespace() || c == '*' || c == '/')
        .filter(|t| !t.is_empty())
        .all(valid_unit_factor)
}

fn valid_unit_factor(token: &str) -> bool {
    if token.parse::<f64>().is_ok() {
        return true;
    }
    let split = token
        .char_indices()
        .find(|&(_, c)| !(c.is_alphabetic() || c == '_' || c == '%' || c == '°'))
        .map_or(token.len(), |(i, _)| i);
    if split == 0 {
        return false;
    }
    let exponent = &token[split..];
    let exponent = exponent
        .strip_prefix('^')
        .or_else(|| exponent.strip_prefix("**"))
        .unwrap_or(exponent);
    exponent.is_empty() || exponent.parse::<i32>().is_ok()
}

/// All definitions of a collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub dimensions: BTreeMap<String, Dimension>,
    pub coord_vars: BTreeMap<String, CoordVar>,
    pub data_vars: BTreeMap<String, DataVar>,
    pub atts: BTreeMap<String, Attribute>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.dimensions.keys().cloned().collect()
    }

    pub fn coord_var(&self, name: &str) -> Option<&CoordVar> {
        self.coord_vars.get(name)
    }

    pub fn data_var(&self, name: &str) -> Option<&DataVar> {
        self.data_vars.get(name)
    }

    /// Shared description of either kind of variable
    pub fn base_var(&self, name: &str) -> Option<&VarBase> {
        self.coord_vars
            .get(name)
            .map(|c| &c.base)
            .or_else(|| self.data_vars.get(name).map(|d| &d.base))
    }

    fn base_var_mut(&mut self, name: &str) -> Option<&mut VarBase> {
        match self.coord_vars.get_mut(name) {
            Some(c) => Some(&mut c.base),
            None => self.data_vars.get_mut(name).map(|d| &mut d.base),
        }
    }

    pub fn is_coord_var(&self, name: &str) -> bool {
        self.coord_vars.contains_key(name)
    }

    pub fn is_data_var(&self, name: &str) -> bool {
        self.data_vars.contains_key(name)
    }

    pub fn is_time_varying(&self, name: &str) -> bool {
        self.base_var(name).is_some_and(|v| v.is_time_varying())
    }

    pub fn is_compressed(&self, name: &str) -> bool {
        self.base_var(name).is_some_and(|v| v.is_compressed())
    }

    pub fn num_time_steps(&self, name: &str) -> Option<usize> {
        self.base_var(name).map(|v| v.num_time_steps())
    }

    pub fn num_ref_levels(&self, name: &str) -> Option<usize> {
        self.base_var(name).map(|v| v.num_ref_levels())
    }

    pub fn cratios(&self, name: &str) -> Option<&[usize]> {
        self.base_var(name).map(|v| v.cratios.as_slice())
    }

    /// Data variables with `ndim` dimensions; with `spatial`, the time
    /// dimension is not counted
    pub fn data_var_names(&self, ndim: usize, spatial: bool) -> Vec<String> {
        self.data_vars
            .values()
            .filter(|v| Self::counted_dims(&v.base, spatial) == ndim)
            .map(|v| v.base.name.clone())
            .collect()
    }

    pub fn coord_var_names(&self, ndim: usize, spatial: bool) -> Vec<String> {
        self.coord_vars
            .values()
            .filter(|v| Self::counted_dims(&v.base, spatial) == ndim)
            .map(|v| v.base.name.clone())
            .collect()
    }

    fn counted_dims(var: &VarBase, spatial: bool) -> usize {
        if spatial {
            var.spatial_dimensions().len()
        } else {
            var.dimensions.len()
        }
    }

    /// Attribute of a variable, or a global one when `var` is `None`
    pub fn get_att(&self, var: Option<&str>, name: &str) -> Option<&Attribute> {
        match var {
            None => self.atts.get(name),
            Some(v) => self.base_var(v)?.atts.get(name),
        }
    }

    pub fn att_names(&self, var: Option<&str>) -> Vec<String> {
        match var {
            None => self.atts.keys().cloned().collect(),
            Some(v) => self
                .base_var(v)
                .map(|b| b.atts.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn att_type(&self, var: Option<&str>, name: &str) -> Option<XType> {
        self.get_att(var, name).map(|a| a.xtype())
    }

    pub fn put_att(&mut self, var: Option<&str>, att: Attribute) -> Result<()> {
        let atts = match var {
            None => &mut self.atts,
            Some(v) => {
                &mut self
                    .base_var_mut(v)
                    .ok_or_else(|| VdcError::NotFound(format!("variable {}", v)))?
                    .atts
            }
        };
        atts.insert(att.name().to_string(), att);
        Ok(())
    }

    pub fn define_dimension(&mut self, name: &str, length: usize, axis: Axis) -> Result<()> {
        if name.is_empty() {
            return Err(VdcError::InvalidDefinition(
                "dimension name is empty".to_string(),
            ));
        }
        if length < 1 {
            return Err(VdcError::InvalidDefinition(format!(
                "dimension {} must have length 1 or more",
                name
            )));
        }
        self.dimensions
            .insert(name.to_string(), Dimension::new(name, length, axis));
        Ok(())
    }

    pub fn remove_dimension(&mut self, name: &str) {
        self.dimensions.remove(name);
    }

    fn lookup_dimensions(&self, names: &[String]) -> Result<Vec<Dimension>> {
        names
            .iter()
            .map(|n| {
                self.dimensions
                    .get(n)
                    .cloned()
                    .ok_or_else(|| VdcError::NotFound(format!("dimension {}", n)))
            })
            .collect()
    }

    fn check_common(
        name: &str,
        dimensions: &[Dimension],
        units: &str,
        xtype: XType,
        compressed: bool,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(VdcError::InvalidDefinition(
                "variable name is empty".to_string(),
            ));
        }
        if dimensions.len() > MAX_DIMS {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: {} dimensions, at most {} allowed",
                name,
                dimensions.len(),
                MAX_DIMS
            )));
        }
        if !valid_units(units) {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: unrecognized units {:?}",
                name, units
            )));
        }
        if compressed && xtype != XType::Float {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: only FLOAT variables can be compressed",
                name
            )));
        }
        if !axes_ordered(dimensions) {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: dimensions must be ordered X, Y, Z, T",
                name
            )));
        }
        Ok(())
    }

    /// Blocking and compression settings resolved for a dimension list
    fn build_base(
        name: &str,
        dimensions: Vec<Dimension>,
        units: String,
        xtype: XType,
        params: &CompressionParams,
        compressed: bool,
    ) -> Result<VarBase> {
        let bs = compute_bs(&dimensions, &params.bs);
        let (wname, cratios) = if compressed {
            if params.wname.is_empty() {
                return Err(VdcError::InvalidCompression(format!(
                    "{}: compression requested without a wavelet",
                    name
                )));
            }
            let spatial = if dimensions.last().is_some_and(|d| d.axis.is_time()) {
                dimensions.len() - 1
            } else {
                dimensions.len()
            };
            let wasp_bs: Vec<usize> = bs[..spatial].iter().rev().copied().collect();
            if wasp_bs.iter().product::<usize>() <= 1 {
                return Err(VdcError::InvalidCompression(format!(
                    "{}: variable cannot be blocked for compression",
                    name
                )));
            }
            BlockCodec::new(&params.wname, &wasp_bs, &params.cratios)?;
            (params.wname.clone(), params.cratios.clone())
        } else {
            (String::new(), vec![1])
        };

        let periodic = (0..dimensions.len())
            .map(|i| params.periodic.get(i).copied().unwrap_or(false))
            .collect();

        Ok(VarBase {
            name: name.to_string(),
            dimensions,
            units,
            xtype,
            bs,
            wname,
            cratios,
            periodic,
            atts: BTreeMap::new(),
        })
    }

    /// Validate and add a coordinate variable. `params` supplies blocking
    /// even for uncompressed variables.
    pub fn define_coord_var(
        &mut self,
        def: &CoordVarDef,
        params: &CompressionParams,
        uniform: bool,
    ) -> Result<()> {
        let mut units = def.units.clone();
        if def.axis.is_time() && units.is_empty() {
            units = "seconds".to_string();
        }
        if def.axis.is_time() && def.dim_names.len() != 1 {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: time coordinate variables must have exactly one dimension",
                def.name
            )));
        }
        if uniform && def.dim_names.len() != 1 {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: uniform coordinate variables have one dimension",
                def.name
            )));
        }

        let dimensions = self.lookup_dimensions(&def.dim_names)?;
        Self::check_common(&def.name, &dimensions, &units, def.xtype, def.compressed)?;

        // a dimension's own coordinate variable keeps the dimension's shape
        if let Some(dim) = self.dimensions.get(&def.name) {
            if def.dim_names.len() != 1
                || def.dim_names[0] != def.name
                || dim.axis != def.axis
                || def.compressed
            {
                return Err(VdcError::InvalidDefinition(format!(
                    "{}: invalid dimension coordinate variable definition",
                    def.name
                )));
            }
        }

        let base = Self::build_base(
            &def.name,
            dimensions,
            units,
            def.xtype,
            params,
            def.compressed,
        )?;
        self.coord_vars.insert(
            def.name.clone(),
            CoordVar {
                base,
                axis: def.axis,
                uniform,
            },
        );
        Ok(())
    }

    pub fn remove_coord_var(&mut self, name: &str) {
        self.coord_vars.remove(name);
    }

    /// Validate and add a data variable
    pub fn define_data_var(&mut self, def: &DataVarDef, params: &CompressionParams) -> Result<()> {
        if def.dim_names.len() != def.coord_vars.len() {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: {} dimensions but {} coordinate variables",
                def.name,
                def.dim_names.len(),
                def.coord_vars.len()
            )));
        }
        let dimensions = self.lookup_dimensions(&def.dim_names)?;
        Self::check_common(
            &def.name,
            &dimensions,
            &def.units,
            def.xtype,
            def.compressed,
        )?;

        let mut cvars = Vec::with_capacity(def.coord_vars.len());
        for c in &def.coord_vars {
            cvars.push(
                self.coord_vars
                    .get(c)
                    .ok_or_else(|| VdcError::NotFound(format!("coordinate variable {}", c)))?,
            );
        }
        if cvars.windows(2).any(|w| w[0].axis >= w[1].axis) {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: coordinate variables must be ordered X, Y, Z, T",
                def.name
            )));
        }

        let base = Self::build_base(
            &def.name,
            dimensions,
            def.units.clone(),
            def.xtype,
            params,
            def.compressed,
        )?;

        for cvar in &cvars {
            let shares = cvar.base.dimensions.iter().any(|cd| {
                base.dimensions
                    .iter()
                    .any(|d| d.length == cd.length && d.axis == cd.axis)
            });
            if !shares {
                return Err(VdcError::InvalidDefinition(format!(
                    "{}: coordinate variable {} shares no dimension with it",
                    def.name, cvar.base.name
                )));
            }
        }

        for (d, cvar) in base.dimensions.iter().zip(&cvars) {
            let mine = base.axis_block_len(d.axis);
            if let Some(theirs) = cvar.base.axis_block_len(d.axis) {
                if mine != Some(theirs) {
                    return Err(VdcError::InvalidDefinition(format!(
                        "{}: blocking differs from coordinate variable {}",
                        def.name, cvar.base.name
                    )));
                }
            }
        }

        if let Some(mask) = &def.mask_var {
            self.check_mask(&base, mask)?;
        }

        self.data_vars.insert(
            def.name.clone(),
            DataVar {
                base,
                coord_vars: def.coord_vars.clone(),
                missing_value: def.missing_value,
                mask_var: def.mask_var.clone(),
            },
        );
        Ok(())
    }

    fn check_mask(&self, var: &VarBase, mask: &str) -> Result<()> {
        let mvar = self
            .data_vars
            .get(mask)
            .map(|m| &m.base)
            .ok_or_else(|| VdcError::NotFound(format!("mask variable {}", mask)))?;

        if mvar.spatial_dimensions() != var.spatial_dimensions() {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: mask {} has different spatial dimensions",
                var.name, mask
            )));
        }
        for d in var.spatial_dimensions() {
            if let Some(mb) = mvar.axis_block_len(d.axis) {
                if var.axis_block_len(d.axis) != Some(mb) {
                    return Err(VdcError::InvalidDefinition(format!(
                        "{}: mask {} is blocked differently along {}",
                        var.name, mask, d.axis
                    )));
                }
            }
        }
        if mvar.cratios.len() < var.cratios.len() {
            return Err(VdcError::InvalidDefinition(format!(
                "{}: mask {} has fewer levels of detail",
                var.name, mask
            )));
        }
        Ok(())
    }
}

fn write_base(f: &mut fmt::Formatter<'_>, var: &VarBase) -> fmt::Result {
    writeln!(f, "   Name: {}", var.name)?;
    writeln!(f, "   Dimensions: {}", var.dim_names().join(" "))?;
    writeln!(f, "   Units: {}", var.units)?;
    writeln!(f, "   XType: {}", var.xtype)?;
    writeln!(f, "   Compressed: {}", var.is_compressed())?;
    writeln!(f, "   BlockSize: {:?}", var.bs)?;
    writeln!(f, "   WaveName: {}", var.wname)?;
    writeln!(f, "   CompressionRatios: {:?}", var.cratios)?;
    writeln!(f, "   Periodic: {:?}", var.periodic)?;
    for att in var.atts.values() {
        writeln!(f, "   Attribute {}: {:?}", att.name(), att.values())?;
    }
    Ok(())
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dimensions")?;
        for d in self.dimensions.values() {
            writeln!(f, "  {} length {} axis {}", d.name, d.length, d.axis)?;
        }
        writeln!(f, "Attributes")?;
        for att in self.atts.values() {
            writeln!(f, "  {}: {:?}", att.name(), att.values())?;
        }
        writeln!(f, "Coordinate variables")?;
        for cvar in self.coord_vars.values() {
            writeln!(f, "  CoordVar")?;
            write_base(f, &cvar.base)?;
            writeln!(f, "   Axis: {}", cvar.axis)?;
            writeln!(f, "   Uniform: {}", cvar.uniform)?;
        }
        writeln!(f, "Data variables")?;
        for dvar in self.data_vars.values() {
            writeln!(f, "  DataVar")?;
            write_base(f, &dvar.base)?;
            writeln!(f, "   CoordVars: {}", dvar.coord_vars.join(" "))?;
            if let Some(mv) = dvar.missing_value {
                writeln!(f, "   MissingValue: {}", mv)?;
            }
            if let Some(mask) = &dvar.mask_var {
                writeln!(f, "   Mask: {}", mask)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Catalog {
        let mut cat = Catalog::new();
        let params = CompressionParams::default();
        for (name, len, axis) in [("x", 100, Axis::X), ("y", 80, Axis::Y), ("z", 40, Axis::Z), ("t", 5, Axis::T)] {
            cat.define_dimension(name, len, axis).unwrap();
            cat.define_coord_var(&CoordVarDef::new(name, &[name], axis), &params, true)
                .unwrap();
        }
        cat
    }

    #[test]
    fn test_compute_bs() {
        let dims = vec![
            Dimension::new("x", 10, Axis::X),
            Dimension::new("y", 10, Axis::Y),
            Dimension::new("t", 3, Axis::T),
        ];
        assert_eq!(compute_bs(&dims, &[64, 64, 64]), vec![64, 64, 1]);
        assert_eq!(compute_bs(&dims[2..], &[64, 64, 64]), vec![1]);
        assert_eq!(compute_bs(&dims[..1], &[32]), vec![32]);
    }

    #[test]
    fn test_parse_dimensions() {
        let dims = vec![
            Dimension::new("x", 10, Axis::X),
            Dimension::new("y", 20, Axis::Y),
            Dimension::new("t", 3, Axis::T),
        ];
        assert_eq!(parse_dimensions(&dims), Some((vec![10, 20], 3)));
        assert_eq!(parse_dimensions(&dims[..2]), Some((vec![10, 20], 1)));
        let unordered = vec![dims[1].clone(), dims[0].clone()];
        assert_eq!(parse_dimensions(&unordered), None);
    }

    #[test]
    fn test_units_grammar() {
        for ok in [
            "",
            "m",
            "m s-1",
            "m/s",
            "kg m^-3",
            "m**2",
            "0.001 m",
            "degrees_north",
            "%",
            "days since 2000-01-01 00:00:00",
        ] {
            assert!(valid_units(ok), "{}", ok);
        }
        for bad in ["m$", "/s", "m/", "days since ", "3x?", "^2"] {
            assert!(!valid_units(bad), "{}", bad);
        }
    }

    #[test]
    fn test_time_coordinate_defaults() {
        let cat = grid();
        let t = cat.coord_var("t").unwrap();
        assert_eq!(t.base.units, "seconds");
        assert_eq!(t.base.bs, vec![1]);
        assert!(cat.is_time_varying("t"));
        assert_eq!(cat.num_time_steps("t"), Some(5));
        assert_eq!(cat.coord_var("x").unwrap().base.bs, vec![64]);
    }

    #[test]
    fn test_define_data_var() {
        let mut cat = grid();
        let params = CompressionParams::default();
        let def = DataVarDef::new("u", &["x", "y", "z", "t"], &["x", "y", "z", "t"])
            .units("m s-1")
            .compressed(true);
        cat.define_data_var(&def, &params).unwrap();

        let u = cat.data_var("u").unwrap();
        assert_eq!(u.base.bs, vec![64, 64, 64, 1]);
        assert!(u.base.is_compressed());
        assert_eq!(u.base.num_ref_levels(), 5);
        assert_eq!(cat.data_var_names(3, true), vec!["u".to_string()]);
        assert_eq!(cat.data_var_names(4, false), vec!["u".to_string()]);
    }

    #[test]
    fn test_single_ratio_is_not_compressed() {
        let mut cat = grid();
        let lossless = CompressionParams::new(vec![64, 64, 64], "bior4.4", vec![1]);
        let def = DataVarDef::new("p", &["x", "y"], &["x", "y"]).compressed(true);
        cat.define_data_var(&def, &lossless).unwrap();

        let p = &cat.data_var("p").unwrap().base;
        assert_eq!(p.wname, "bior4.4");
        assert_eq!(p.cratios, vec![1]);
        assert!(!p.is_compressed());
        assert!(!cat.is_compressed("p"));
        assert_eq!(p.num_ref_levels(), 1);

        let def = DataVarDef::new("q", &["x", "y"], &["x", "y"]).compressed(true);
        cat.define_data_var(&def, &CompressionParams::default()).unwrap();
        assert!(cat.is_compressed("q"));
    }

    #[test]
    fn test_rejects_bad_data_vars() {
        let mut cat = grid();
        let params = CompressionParams::default();

        // misordered axes
        let def = DataVarDef::new("a", &["y", "x"], &["y", "x"]);
        assert!(cat.define_data_var(&def, &params).is_err());
        // compressed integers
        let def = DataVarDef::new("a", &["x", "y"], &["x", "y"])
            .xtype(XType::Int32)
            .compressed(true);
        assert!(cat.define_data_var(&def, &params).is_err());
        // unknown dimension
        let def = DataVarDef::new("a", &["x", "w"], &["x", "y"]);
        assert!(matches!(
            cat.define_data_var(&def, &params),
            Err(VdcError::NotFound(_))
        ));
        // blocking differs from the coordinate variable
        let other = CompressionParams::new(vec![32, 32, 32], "bior4.4", vec![10, 1]);
        let def = DataVarDef::new("a", &["x", "y"], &["x", "y"]);
        assert!(cat.define_data_var(&def, &other).is_err());
        // bad units
        let def = DataVarDef::new("a", &["x", "y"], &["x", "y"]).units("m$");
        assert!(cat.define_data_var(&def, &params).is_err());
    }

    #[test]
    fn test_dimension_coord_var_is_fixed() {
        let mut cat = grid();
        let params = CompressionParams::default();
        let moved = CoordVarDef::new("x", &["x"], Axis::Y);
        assert!(cat.define_coord_var(&moved, &params, false).is_err());
        let compressed = CoordVarDef::new("x", &["x"], Axis::X).compressed(true);
        assert!(cat.define_coord_var(&compressed, &params, false).is_err());
        let two_d_time = CoordVarDef::new("tt", &["x", "t"], Axis::T);
        assert!(cat.define_coord_var(&two_d_time, &params, false).is_err());
    }

    #[test]
    fn test_mask_rules() {
        let mut cat = grid();
        let params = CompressionParams::default();
        let mask = DataVarDef::new("land", &["x", "y"], &["x", "y"]).xtype(XType::Int32);
        cat.define_data_var(&mask, &params).unwrap();

        let def = DataVarDef::new("sst", &["x", "y", "t"], &["x", "y", "t"]).mask("land", -999.0);
        cat.define_data_var(&def, &params).unwrap();
        assert_eq!(cat.data_var("sst").unwrap().missing_value, Some(-999.0));

        // compressed variable needs a mask with as many levels of detail
        let two_d = CompressionParams::new(vec![64, 64, 64], "bior4.4", vec![100, 10, 1]);
        let def = DataVarDef::new("sst2", &["x", "y", "t"], &["x", "y", "t"])
            .compressed(true)
            .mask("land", -999.0);
        assert!(cat.define_data_var(&def, &two_d).is_err());
        let def = DataVarDef::new("sst2", &["x", "y", "t"], &["x", "y", "t"]).compressed(true);
        cat.define_data_var(&def, &two_d).unwrap();

        let def = DataVarDef::new("vol", &["x", "y", "z"], &["x", "y", "z"]).mask("land", 0.0);
        assert!(cat.define_data_var(&def, &params).is_err());
    }

    #[test]
    fn test_attributes() {
        let mut cat = grid();
        cat.put_att(None, Attribute::new("title", XType::Text, "test"))
            .unwrap();
        cat.put_att(Some("x"), Attribute::new("scale", XType::Double, vec![2.5]))
            .unwrap();
        assert!(cat
            .put_att(Some("nope"), Attribute::new("a", XType::Int32, vec![1i64]))
            .is_err());

        assert_eq!(cat.get_att(None, "title").unwrap().as_text(), "test");
        assert_eq!(cat.att_type(Some("x"), "scale"), Some(XType::Double));
        assert_eq!(cat.att_names(Some("x")), vec!["scale".to_string()]);
        assert!(cat.to_string().contains("Attribute scale"));
    }
}
