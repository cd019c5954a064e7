use cfin_adapters::{transform_receipt, DropReason, FixturePageSource, PageRequest, PageSource};
use cfin_core::{Contributor, IngestionCheckpoint};

fn fixture_dir() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/openfec/schedule_a")
}

#[tokio::test]
async fn captured_pages_transform_and_chain() {
    let source = FixturePageSource::from_dir(fixture_dir()).expect("fixture dir");
    assert_eq!(source.len(), 2);

    let mut checkpoint = IngestionCheckpoint::empty("schedule_a_2024");
    let first = source
        .fetch_page(&PageRequest::from_checkpoint(&checkpoint, vec![2024], 100))
        .await
        .expect("first page");
    assert_eq!(first.records.len(), 3);

    let drafts = first
        .records
        .iter()
        .map(|raw| transform_receipt(raw, 2024))
        .collect::<Vec<_>>();
    assert!(matches!(drafts[0], Ok(ref d) if d.contributor == Contributor::Individual));
    let pac = drafts[1].as_ref().expect("pac receipt");
    assert_eq!(pac.record.contributor_id.as_deref(), Some("C00000777"));
    assert_eq!(pac.record.filing.report_year, Some(2024));
    assert!(matches!(drafts[2], Err(DropReason::NoContributor(_))));

    checkpoint = checkpoint.advanced(&first.next);
    let second = source
        .fetch_page(&PageRequest::from_checkpoint(&checkpoint, vec![2024], 100))
        .await
        .expect("second page");
    assert_eq!(second.records.len(), 1);

    checkpoint = checkpoint.advanced(&second.next);
    let tail = source
        .fetch_page(&PageRequest::from_checkpoint(&checkpoint, vec![2024], 100))
        .await
        .expect("tail");
    assert!(tail.is_empty());
    assert_eq!(checkpoint.pages_completed, 2);
}

#[test]
fn unreadable_fixture_dir_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("page-001.json"), b"{not json").expect("write");
    let err = FixturePageSource::from_dir(dir.path()).expect_err("bad fixture");
    assert!(err.to_string().contains("page-001.json"));
}
