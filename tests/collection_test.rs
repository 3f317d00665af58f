//! End-to-end tests of collections stored on the local filesystem

use std::sync::Arc;
use tempfile::TempDir;
use vdc::container::ContainerFile;
use vdc::{
    AccessMode, Axis, CompressionParams, CoordVarDef, DataVarDef, ErrorKind, FileSystemIoManager,
    IoManager, Vdc, VdcConfig, VdcError, WaspFile, WaspOptions, XType,
};

fn config() -> VdcConfig {
    VdcConfig::default()
        .with_nthreads(2)
        .with_compression(CompressionParams::new(
            vec![16, 16, 16],
            "bior2.2",
            vec![8, 1],
        ))
}

/// Smooth field, X varying fastest
fn smooth(nx: usize, ny: usize, nz: usize) -> Vec<f32> {
    let mut v = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                v.push((x as f32 * 0.2).sin() * (y as f32 * 0.15).cos() + z as f32 * 0.05);
            }
        }
    }
    v
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "value {}: {} vs {}", i, x, y);
    }
}

fn create(dir: &TempDir, config: VdcConfig) -> Vdc {
    Vdc::initialize_with_config(dir.path().join("run.nc"), AccessMode::Write, config)
        .expect("create collection")
}

fn define_grid(vdc: &mut Vdc, nx: usize, ny: usize, nz: usize) {
    vdc.define_dimension("x", nx, Axis::X).unwrap();
    vdc.define_dimension("y", ny, Axis::Y).unwrap();
    vdc.define_dimension("z", nz, Axis::Z).unwrap();
}

/// Copy the box `start..start+count` out of an X-fastest array
fn subset(data: &[f32], dims: &[usize], start: &[usize], count: &[usize]) -> Vec<f32> {
    let mut out = Vec::new();
    for z in start[2]..start[2] + count[2] {
        for y in start[1]..start[1] + count[1] {
            let row = (z * dims[1] + y) * dims[0];
            out.extend_from_slice(&data[row + start[0]..row + start[0] + count[0]]);
        }
    }
    out
}

#[test]
fn test_lossless_round_trip_with_partial_blocks() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config().with_nthreads(3));
    define_grid(&mut vdc, 40, 36, 20);
    vdc.define_data_var(
        DataVarDef::new("temp", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let data = smooth(40, 36, 20);
    vdc.put_var("temp", -1, &data).unwrap();

    let mut out = vec![0.0; data.len()];
    vdc.get_var("temp", -1, -1, &mut out).unwrap();
    assert_close(&out, &data, 1e-3);

    let mut coarse = vec![0.0; data.len()];
    vdc.get_var("temp", -1, 0, &mut coarse).unwrap();
    assert!(coarse.iter().all(|v| v.is_finite()));
    vdc.close().unwrap();
}

#[test]
fn test_region_and_block_reads() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config());
    define_grid(&mut vdc, 40, 36, 20);
    vdc.define_data_var(
        DataVarDef::new("temp", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let dims = [40, 36, 20];
    let data = smooth(40, 36, 20);
    vdc.put_var("temp", -1, &data).unwrap();

    vdc.open_variable_read(0, "temp", -1, -1).unwrap();
    let (min, max) = ([3, 5, 2], [30, 20, 17]);
    let count = [28, 16, 16];
    let mut region = vec![0.0; 28 * 16 * 16];
    vdc.read_region(&min, &max, &mut region).unwrap();
    assert_close(&region, &subset(&data, &dims, &min, &count), 1e-3);

    let mut block = vec![0.0; 16 * 16 * 16];
    vdc.read_region_block(&[16, 16, 0], &[31, 31, 15], &mut block)
        .unwrap();
    assert_close(
        &block,
        &subset(&data, &dims, &[16, 16, 0], &[16, 16, 16]),
        1e-3,
    );

    let err = vdc
        .read_region_block(&[3, 0, 0], &[18, 15, 15], &mut block)
        .unwrap_err();
    assert!(matches!(err, VdcError::InvalidHyperslab(_)));
    vdc.close_variable().unwrap();
}

#[test]
fn test_writes_must_be_block_aligned() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config());
    define_grid(&mut vdc, 40, 36, 20);
    vdc.define_data_var(
        DataVarDef::new("temp", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let buf = vec![1.0; 16 * 16 * 16];
    vdc.open_variable_write(0, "temp", -1).unwrap();
    let err = vdc.write(&[1, 0, 0], &[16, 16, 16], &buf).unwrap_err();
    assert!(matches!(err, VdcError::InvalidHyperslab(_)));
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(vdc.write(&[0, 0, 0], &[10, 16, 16], &buf).is_err());

    // a short count is fine when it reaches the far boundary
    vdc.write(&[32, 0, 0], &[8, 16, 16], &buf).unwrap();
    vdc.close_variable().unwrap();
}

#[test]
fn test_level_of_detail_is_clamped_to_what_was_written() {
    let dir = TempDir::new().unwrap();
    let config = config().with_compression(CompressionParams::new(
        vec![16, 16, 16],
        "bior1.1",
        vec![500, 100, 10, 1],
    ));
    let mut vdc = create(&dir, config);
    define_grid(&mut vdc, 32, 32, 16);
    vdc.define_data_var(
        DataVarDef::new("v", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let data = smooth(32, 32, 16);
    vdc.open_variable_write(0, "v", 2).unwrap();
    vdc.write(&[0, 0, 0], &[32, 32, 16], &data).unwrap();
    vdc.close_variable().unwrap();

    assert!(vdc.variable_exists(0, "v", -1, 2));
    assert!(!vdc.variable_exists(0, "v", -1, 3));

    let mut lod2 = vec![0.0; data.len()];
    vdc.get_var_ts(0, "v", -1, 2, &mut lod2).unwrap();
    let mut lod3 = vec![0.0; data.len()];
    vdc.get_var_ts(0, "v", -1, 3, &mut lod3).unwrap();
    assert_eq!(lod2, lod3);
}

#[test]
fn test_every_level_of_detail_has_its_own_file() {
    let dir = TempDir::new().unwrap();
    let ratios = vec![64, 16, 4, 1];
    let config = config().with_compression(CompressionParams::new(
        vec![16, 16, 16],
        "bior2.2",
        ratios.clone(),
    ));
    let mut vdc = create(&dir, config);
    define_grid(&mut vdc, 32, 32, 16);
    vdc.define_data_var(
        DataVarDef::new("v", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();
    vdc.put_var("v", -1, &smooth(32, 32, 16)).unwrap();

    let files: Vec<_> = (0..ratios.len())
        .map(|lod| vdc.get_path("v", 0, lod as i32).unwrap().path)
        .collect();
    for (lod, path) in files.iter().enumerate() {
        let name = format!("run_data/data/v/v.nc{}", lod);
        assert!(path.ends_with(&name), "{:?}", path);
        assert!(path.exists(), "{:?}", path);
    }
    assert!(!dir.path().join("run_data/data/v/v.nc").exists());
    assert_eq!(vdc.get_path("v", 0, 9).unwrap().path, files[3]);
    assert_eq!(vdc.get_path("v", 0, -1).unwrap().path, files[3]);

    let io: Arc<dyn IoManager> = Arc::new(FileSystemIoManager::new(files[0].parent().unwrap()));
    let wasp = WaspFile::open(io.clone(), "v.nc0", false, &WaspOptions::default()).unwrap();
    assert_eq!(wasp.num_present_files(), ratios.len());

    // each level adds at least as many coefficients as the one before, and
    // the lossless level completes the block
    let ncoeffs = wasp.inq_var_ncoeffs("v").unwrap();
    assert_eq!(ncoeffs.len(), ratios.len());
    assert!(ncoeffs.windows(2).all(|w| w[0] <= w[1]), "{:?}", ncoeffs);
    assert_eq!(ncoeffs.iter().sum::<usize>(), 16 * 16 * 16);

    for (lod, &n) in ncoeffs.iter().enumerate() {
        let file = ContainerFile::open(io.clone(), &format!("v.nc{}", lod), false).unwrap();
        let (_, dims) = file.inq_var_dims("v").unwrap();
        assert!(dims.last().is_some_and(|&slot| slot >= n), "lod {}: {:?}", lod, dims);
    }
}

#[test]
fn test_time_varying_variables_are_grouped_into_files() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config().with_variable_threshold(16 * 16 * 3));
    vdc.define_dimension("x", 16, Axis::X).unwrap();
    vdc.define_dimension("y", 16, Axis::Y).unwrap();
    vdc.define_dimension("t", 7, Axis::T).unwrap();
    vdc.define_data_var(
        DataVarDef::new("h", &["x", "y", "t"], &["x", "y", "t"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let data = smooth(16, 16, 7);
    vdc.put_var("h", -1, &data).unwrap();

    let path = vdc.get_path("h", 4, 0).unwrap();
    assert!(path.path.ends_with("run_data/data/h/h.0001.nc0"));
    assert_eq!((path.file_ts, path.max_ts), (1, 3));
    for ts in [0, 3, 6] {
        for lod in [0, 1] {
            assert!(vdc.get_path("h", ts, lod).unwrap().path.exists());
        }
    }
    assert!(vdc.get_path("h", 7, 0).is_err());

    let mut out = vec![0.0; data.len()];
    vdc.get_var("h", -1, -1, &mut out).unwrap();
    assert_close(&out, &data, 1e-3);

    let mut t = vec![0.0; 7];
    vdc.get_var("t", -1, -1, &mut t).unwrap();
    assert_eq!(t, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_uniform_coordinates_are_filled() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config().with_master_threshold(0));
    define_grid(&mut vdc, 12, 5, 3);
    vdc.end_define().unwrap();

    let mut x = vec![0.0; 12];
    vdc.get_var("x", -1, -1, &mut x).unwrap();
    assert_eq!(x, (0..12).map(|i| i as f32).collect::<Vec<_>>());

    let path = vdc.get_path("x", 0, -1).unwrap();
    assert!(path.path.ends_with("run_data/coordinates/x/x.nc"));
    assert!(path.path.exists());
}

#[test]
fn test_masked_points_read_as_missing() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config());
    vdc.define_dimension("x", 20, Axis::X).unwrap();
    vdc.define_dimension("y", 18, Axis::Y).unwrap();
    let params = CompressionParams::new(vec![16, 16, 16], "bior2.2", vec![4, 1]);
    vdc.define_data_var(
        DataVarDef::new("land", &["x", "y"], &["x", "y"])
            .compressed(true)
            .compression(params.clone()),
    )
    .unwrap();
    vdc.define_data_var(
        DataVarDef::new("sst", &["x", "y"], &["x", "y"])
            .compressed(true)
            .compression(params)
            .mask("land", -999.0),
    )
    .unwrap();
    vdc.end_define().unwrap();

    let land: Vec<f32> = (0..20 * 18)
        .map(|i| if i % 20 < 10 { 1.0 } else { 0.0 })
        .collect();
    vdc.put_var("land", -1, &land).unwrap();
    let sst = smooth(20, 18, 1);
    vdc.put_var("sst", -1, &sst).unwrap();

    let mut out = vec![0.0; sst.len()];
    vdc.get_var("sst", -1, -1, &mut out).unwrap();
    for (i, (&got, &want)) in out.iter().zip(&sst).enumerate() {
        if i % 20 < 10 {
            assert!((got - want).abs() < 1e-3, "point {}", i);
        } else {
            assert_eq!(got, -999.0, "point {}", i);
        }
    }

    // at a coarser level the mask is resampled to the level grid
    let (dims, _) = vdc.get_dim_lens_at_level("sst", 2).unwrap();
    assert_eq!(dims, vec![10, 9]);
    let mut coarse = vec![0.0; 90];
    vdc.get_var("sst", 2, -1, &mut coarse).unwrap();
    for (i, &v) in coarse.iter().enumerate() {
        assert_eq!(v == -999.0, i % 10 >= 5, "point {}", i);
    }
}

#[test]
fn test_coarse_level_of_constant_field() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config());
    vdc.define_dimension("x", 50, Axis::X).unwrap();
    vdc.define_dimension("y", 40, Axis::Y).unwrap();
    vdc.define_data_var(DataVarDef::new("c", &["x", "y"], &["x", "y"]).compressed(true))
        .unwrap();
    vdc.end_define().unwrap();

    assert_eq!(vdc.num_ref_levels("c"), Some(4));
    vdc.put_var("c", -1, &vec![5.0; 50 * 40]).unwrap();

    let (dims, bs) = vdc.get_dim_lens_at_level("c", 1).unwrap();
    assert_eq!((dims.clone(), bs), (vec![12, 10], vec![4, 4]));
    let mut out = vec![0.0; 120];
    vdc.get_var("c", 1, -1, &mut out).unwrap();
    assert_close(&out, &[5.0; 120], 1e-3);

    assert!(vdc.open_variable_read(0, "c", 4, -1).is_err());
}

#[test]
fn test_catalog_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut vdc = create(&dir, config());
    define_grid(&mut vdc, 20, 20, 10);
    vdc.define_dimension("t", 4, Axis::T).unwrap();
    vdc.define_coord_var(
        CoordVarDef::new("time", &["t"], Axis::T).units("days since 2000-01-01"),
    )
    .unwrap();
    vdc.define_data_var(
        DataVarDef::new("wind", &["x", "y", "z", "t"], &["x", "y", "z", "time"])
            .units("m/s")
            .compressed(true),
    )
    .unwrap();
    vdc.define_data_var(
        DataVarDef::new("depth", &["x", "y"], &["x", "y"])
            .xtype(XType::Double)
            .missing_value(-1.0),
    )
    .unwrap();
    vdc.put_att(None, "title", XType::Text, "storm run").unwrap();
    vdc.put_att(Some("wind"), "scale", XType::Double, vec![0.5f64, 2.0])
        .unwrap();
    vdc.put_att(Some("depth"), "flags", XType::Int32, vec![1i32, 2, 3])
        .unwrap();
    vdc.end_define().unwrap();
    let written = vdc.catalog().clone();
    vdc.close().unwrap();

    let vdc = Vdc::initialize_with_config(dir.path().join("run.nc"), AccessMode::Read, config())
        .unwrap();
    assert_eq!(vdc.catalog(), &written);
    assert_eq!(vdc.get_att(None, "title").unwrap().as_text(), "storm run");
    assert_eq!(
        vdc.get_att(Some("wind"), "scale").unwrap().as_f64(),
        vec![0.5, 2.0]
    );
    assert!(vdc.is_compressed("wind"));
    assert!(vdc.is_time_varying("wind"));
    assert_eq!(vdc.num_time_steps("wind"), Some(4));
    assert!(!vdc.is_define_mode());
}

#[test]
fn test_append_adds_variables() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.nc");
    let mut vdc = create(&dir, config());
    define_grid(&mut vdc, 20, 20, 10);
    vdc.define_data_var(
        DataVarDef::new("a", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
    )
    .unwrap();
    vdc.end_define().unwrap();
    let a = smooth(20, 20, 10);
    vdc.put_var("a", -1, &a).unwrap();
    vdc.close().unwrap();

    let mut vdc =
        Vdc::initialize_with_config(&path, AccessMode::Append, config()).unwrap();
    assert!(vdc.is_define_mode());
    let err = vdc
        .define_data_var(DataVarDef::new("a", &["x", "y", "z"], &["x", "y", "z"]))
        .unwrap_err();
    assert!(matches!(err, VdcError::AlreadyExists(_)));

    vdc.define_dimension("w", 6, Axis::X).unwrap();
    vdc.define_data_var(DataVarDef::new("b", &["w"], &["w"]))
        .unwrap();
    vdc.end_define().unwrap();
    vdc.put_var("b", -1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    vdc.close().unwrap();

    let mut vdc = Vdc::initialize_with_config(&path, AccessMode::Read, config()).unwrap();
    let mut out = vec![0.0; a.len()];
    vdc.get_var("a", -1, -1, &mut out).unwrap();
    assert_close(&out, &a, 1e-3);
    let mut b = vec![0.0; 6];
    vdc.get_var("b", -1, -1, &mut b).unwrap();
    assert_eq!(b, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let mut w = vec![0.0; 6];
    vdc.get_var("w", -1, -1, &mut w).unwrap();
    assert_eq!(w, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_read_only_collection_rejects_changes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.nc");
    let mut vdc = create(&dir, config());
    define_grid(&mut vdc, 8, 8, 8);
    vdc.end_define().unwrap();
    vdc.close().unwrap();

    let mut vdc = Vdc::initialize_with_config(&path, AccessMode::Read, config()).unwrap();
    assert!(matches!(
        vdc.define_dimension("q", 4, Axis::X),
        Err(VdcError::NotDefineMode(_))
    ));
    assert!(matches!(
        vdc.open_variable_write(0, "x", -1),
        Err(VdcError::InvalidState(_))
    ));
    assert!(Vdc::initialize(dir.path().join("missing.nc"), AccessMode::Read).is_err());
}

#[test]
fn test_files_from_a_previous_collection_are_not_read() {
    let dir = TempDir::new().unwrap();
    let data = smooth(16, 16, 16);

    let mut first = create(&dir, config());
    define_grid(&mut first, 16, 16, 16);
    first
        .define_data_var(
            DataVarDef::new("u", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
        )
        .unwrap();
    first.end_define().unwrap();
    first.put_var("u", -1, &data).unwrap();
    first.close().unwrap();

    let mut second = create(&dir, config());
    define_grid(&mut second, 16, 16, 16);
    second
        .define_data_var(
            DataVarDef::new("u", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
        )
        .unwrap();
    second.end_define().unwrap();

    let mut out = vec![0.0; data.len()];
    let err = second.get_var("u", -1, -1, &mut out).unwrap_err();
    assert!(matches!(err, VdcError::InvalidFormat(_)));

    let fresh: Vec<f32> = data.iter().map(|v| v * 2.0).collect();
    second.put_var("u", -1, &fresh).unwrap();
    second.get_var("u", -1, -1, &mut out).unwrap();
    assert_close(&out, &fresh, 1e-3);
}
