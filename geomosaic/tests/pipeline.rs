//! End-to-end pipeline runs against the flat-file store.

use geomosaic::pipeline::{GroupInput, Pipeline, PipelineConfig};
use geomosaic::raster::{
    DataType, FlatFileStore, Geotransform, RasterStore, ResampleMethod, WGS84_WKT,
};
use geomosaic::warp::GridAlignedWarper;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NODATA: f64 = -9999.0;

fn pipeline(workspace: &Path) -> Pipeline {
    let store: Arc<dyn RasterStore> = Arc::new(FlatFileStore::new());
    let warper = Arc::new(GridAlignedWarper::new(Arc::clone(&store)));
    let mut config = PipelineConfig::new(workspace);
    config.cell_size = 1.0;
    config.n_workers = 4;
    config.update_interval = Duration::from_millis(25);
    config.resample = ResampleMethod::Nearest;
    Pipeline::new(store, warper, config)
}

/// Writes a 1-degree tile of constant `value` with its upper-left corner at
/// `origin` in WGS84.
fn make_tile(dir: &Path, name: &str, origin: (f64, f64), cols: u32, rows: u32, value: f64) -> PathBuf {
    let store = FlatFileStore::new();
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut handle = store
        .create(&path, cols, rows, DataType::F64, NODATA, (8, 8))
        .unwrap();
    handle
        .set_georeference(Geotransform::new(origin.0, origin.1, 1.0, -1.0), WGS84_WKT)
        .unwrap();
    handle.fill(value).unwrap();
    handle.flush().unwrap();
    path
}

fn read_window(path: &Path, x: u32, y: u32, w: u32, h: u32) -> Vec<f64> {
    let store = FlatFileStore::new();
    let mut handle = store.open(path).unwrap();
    handle.read_block(x, y, w, h).unwrap().data
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overlapping_tiles_merge_first_writer_wins() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");

    // Tiles overlap on a 2x2 patch; chain order makes region_a the winner.
    let a = make_tile(dir.path(), "region_a/export.ras", (10.0, 50.0), 4, 4, 5.0);
    let b = make_tile(dir.path(), "region_b/export.ras", (12.0, 48.0), 4, 4, 9.0);

    let reports = pipeline(&workspace)
        .run(vec![GroupInput {
            key: "export.ras".into(),
            sample_path: a.clone(),
            tile_paths: vec![a, b],
        }])
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.succeeded());
    assert_eq!(report.tiles, 2);

    // Global pixel space: col = lon + 180, row = 90 - lat.
    let mosaic = workspace.join("export.ras");
    assert!(read_window(&mosaic, 190, 40, 2, 2).iter().all(|&v| v == 5.0));
    assert!(read_window(&mosaic, 194, 44, 2, 2).iter().all(|&v| v == 9.0));
    // The contested patch keeps the first tile's values.
    assert!(read_window(&mosaic, 192, 42, 2, 2).iter().all(|&v| v == 5.0));
    // Untouched cells stay nodata.
    assert!(read_window(&mosaic, 0, 0, 2, 2).iter().all(|&v| v == NODATA));

    let finalized = &report.finalized_path;
    assert_eq!(finalized, &workspace.join("export_compressed.ras"));
    let store = FlatFileStore::new();
    let desc = store.describe(finalized).unwrap();
    assert_eq!((desc.cols, desc.rows), (360, 180));
    assert!(read_window(finalized, 190, 40, 2, 2).iter().all(|&v| v == 5.0));

    // 180-row raster pyramids down to level 128.
    let levels: Vec<u32> = FlatFileStore::overview_summary(finalized)
        .unwrap()
        .iter()
        .map(|l| l.level)
        .collect();
    assert_eq!(levels, vec![2, 4, 8, 16, 32, 64, 128]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_skips_all_completed_work() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    let tile = make_tile(dir.path(), "region_a/export.ras", (10.0, 50.0), 4, 4, 5.0);
    let group = GroupInput {
        key: "export.ras".into(),
        sample_path: tile.clone(),
        tile_paths: vec![tile.clone()],
    };

    pipeline(&workspace).run(vec![group.clone()]).await.unwrap();

    let mosaic = workspace.join("export.ras");
    let token = workspace.join("export_1.TOKEN");
    let warped = tile.with_file_name("export_wgs84.ras");
    let merged = tile.with_file_name("export_wgs84.MOSAICKED");
    let compressed = workspace.join("export_compressed.ras");
    for path in [&mosaic, &token, &warped, &merged, &compressed] {
        assert!(path.exists(), "missing artifact {}", path.display());
    }
    let before: Vec<_> = [&mosaic, &token, &warped, &merged, &compressed]
        .into_iter()
        .map(|p| mtime(p))
        .collect();

    // Resume over a completed workspace must not rewrite anything.
    pipeline(&workspace).run(vec![group]).await.unwrap();
    let after: Vec<_> = [&mosaic, &token, &warped, &merged, &compressed]
        .into_iter()
        .map(|p| mtime(p))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_group_does_not_block_sibling_group() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");

    let good = make_tile(dir.path(), "region_a/good.ras", (10.0, 50.0), 4, 4, 5.0);
    let bad_sample = make_tile(dir.path(), "region_a/bad.ras", (10.0, 50.0), 4, 4, 1.0);
    // Exists on disk, so validation passes, but it is not a raster.
    let garbage = dir.path().join("region_b/bad.ras");
    std::fs::create_dir_all(garbage.parent().unwrap()).unwrap();
    std::fs::write(&garbage, b"not a raster").unwrap();

    let groups = vec![
        GroupInput {
            key: "good.ras".into(),
            sample_path: good.clone(),
            tile_paths: vec![good],
        },
        GroupInput {
            key: "bad.ras".into(),
            sample_path: bad_sample.clone(),
            tile_paths: vec![bad_sample, garbage],
        },
    ];

    let err = pipeline(&workspace).run(groups).await.unwrap_err();
    let reports = match err {
        geomosaic::PipelineError::GroupsFailed { reports } => reports,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(reports.len(), 2);

    let good_report = reports.iter().find(|r| r.key == "good.ras").unwrap();
    assert!(good_report.succeeded());
    assert!(good_report.finalized_path.exists());

    let bad_report = reports.iter().find(|r| r.key == "bad.ras").unwrap();
    assert!(!bad_report.succeeded());
    // The partial mosaic survives for inspection; the missing finalized
    // artifact is what marks the group incomplete.
    assert!(bad_report.raster_path.exists());
    assert!(!bad_report.finalized_path.exists());
}
