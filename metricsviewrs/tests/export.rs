//! Exporting resolved results to files.

mod common;

use std::fs;

use metricsview::export::{export_to_dir, generate_filename, FileFormat};
use metricsview::{CacheableQuery, MeasureRequest, SecurityClaims, Sort, ToplistQuery};

#[tokio::test]
async fn toplist_exports_to_csv_and_parquet() -> anyhow::Result<()> {
    let rt = common::bids_runtime().await?;
    let q = ToplistQuery {
        metrics_view: "bids".into(),
        dimension: "publisher".into(),
        measures: vec![MeasureRequest::named("records")],
        sort: vec![Sort::desc("records"), Sort::asc("publisher")],
        ..Default::default()
    };
    let result = rt.resolve(&q, &SecurityClaims::default()).await?;
    let dir = tempfile::tempdir()?;
    let name = generate_filename("bids", Some("publisher"), false);

    let csv_path = export_to_dir(&result, FileFormat::Csv, dir.path(), &name)?;
    assert!(csv_path.ends_with("bids_publisher.csv"));
    let text = fs::read_to_string(&csv_path)?;
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("publisher,records"));
    assert_eq!(lines.next(), Some("acme,2"));
    assert_eq!(lines.count(), 2);

    let parquet_path = export_to_dir(&result, FileFormat::Parquet, dir.path(), &name)?;
    assert!(fs::metadata(&parquet_path)?.len() > 0);

    let xlsx_path = export_to_dir(&result, FileFormat::Xlsx, dir.path(), &name)?;
    let bytes = fs::read(xlsx_path)?;
    assert_eq!(&bytes[..2], b"PK");
    Ok(())
}

#[test]
fn cache_keys_follow_query_fields() {
    let base = ToplistQuery {
        metrics_view: "bids".into(),
        dimension: "publisher".into(),
        ..Default::default()
    };
    let other = ToplistQuery {
        dimension: "domain".into(),
        ..base.clone()
    };
    assert_ne!(base.key().unwrap(), other.key().unwrap());
    assert_eq!(base.key().unwrap(), base.clone().key().unwrap());
}
