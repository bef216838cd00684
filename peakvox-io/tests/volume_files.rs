use approx::assert_relative_eq;
use peakvox_algorithms::{find_and_integrate, BlobFinder, FinderConfig, IntegrationConfig, Threshold};
use peakvox_core::{FrameSource, Progress, SerializedSource, Volume};
use peakvox_io::{write_raw_volume, PeakRow, PeakWriter, RawVolumeReader};
use tempfile::tempdir;

fn scan() -> Volume {
    Volume::from_fn(20, 20, 20, |(z, y, x)| {
        let d2 = (x as f64 - 9.5).powi(2) + (y as f64 - 9.5).powi(2) + (z as f64 - 9.5).powi(2);
        10.0 + 1000.0 * (-d2 / 18.0).exp()
    })
}

#[test]
fn test_mapped_volume_matches_memory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.pvx");
    let volume = scan();
    write_raw_volume(&path, &volume).unwrap();

    let reader = RawVolumeReader::open(&path).unwrap();
    assert_eq!(reader.path(), path.as_path());
    let copy = Volume::from_source(&reader).unwrap();
    for (a, b) in volume.data().iter().zip(copy.data()) {
        assert_relative_eq!(a, b, max_relative = 1e-6);
    }
}

#[test]
fn test_find_on_mapped_volume_and_export() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.pvx");
    write_raw_volume(&path, &scan()).unwrap();
    let reader = RawVolumeReader::open(&path).unwrap();

    let finder = BlobFinder::new(
        FinderConfig::new()
            .with_threshold(Threshold::Absolute(19.5))
            .with_workers(3),
    )
    .unwrap();
    let integration = IntegrationConfig::new().with_scales(1.0, 1.3, 2.3);

    let report = find_and_integrate(&reader, &finder, &integration, &Progress::new()).unwrap();
    assert_eq!(report.peaks.len(), 1);
    // a source behind a lock gives the same answer
    let serialized = SerializedSource::new(RawVolumeReader::open(&path).unwrap());
    let again = find_and_integrate(&serialized, &finder, &integration, &Progress::new()).unwrap();
    assert_eq!(again.peaks.len(), 1);
    assert_eq!(
        again.peaks[0].feature.blob.component_count(),
        report.peaks[0].feature.blob.component_count()
    );
    let (first, second) = (
        report.peaks[0].integrated().unwrap(),
        again.peaks[0].integrated().unwrap(),
    );
    assert_relative_eq!(first.intensity, second.intensity, max_relative = 1e-9);
    assert_relative_eq!(first.background_mean, 10.0, max_relative = 0.05);

    let rows: Vec<PeakRow> = report.peaks.iter().map(PeakRow::from).collect();
    let csv = dir.path().join("peaks.csv");
    PeakWriter::create(&csv).unwrap().write_csv(&rows).unwrap();
    let content = std::fs::read_to_string(&csv).unwrap();
    assert_eq!(content.lines().count(), 2);

    let json = dir.path().join("peaks.json");
    PeakWriter::create(&json).unwrap().write_json(&rows).unwrap();
    let content = std::fs::read_to_string(&json).unwrap();
    assert!(content.contains("\"rocking_curve\""));
    assert_eq!(reader.n_frames(), 20);
}
