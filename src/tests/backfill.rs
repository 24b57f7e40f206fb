use std::collections::HashMap;

use super::Fixture;
use crate::backfill::ItemStatus;
use crate::catalog::tests::product;
use crate::catalog::{image_fingerprint, Catalog, Product};
use crate::images::tests::create_solid_png;

fn catalog_with_images(count: u64) -> (Vec<Product>, HashMap<String, Vec<u8>>) {
    let mut products = vec![];
    let mut images = HashMap::new();
    for id in 1..=count {
        let url = format!("https://cdn.test/{id}.png");
        let shade = (id * 20 % 256) as u8;
        images.insert(url.clone(), create_solid_png(16, 16, [shade, 255 - shade, 40]));
        products.push(product(id, &format!("Item {id}"), &[url.as_str()]));
    }
    (products, images)
}

#[test]
fn test_backfill_walks_catalog_in_batches() {
    let (products, images) = catalog_with_images(12);
    let fixture = Fixture::new(products, vec![], images);
    let worker = &fixture.app.backfill;

    assert_eq!(worker.pending().unwrap(), 12);

    let first = worker.run_batch(5).unwrap();
    assert_eq!((first.processed, first.success, first.failed), (5, 5, 0));
    assert!(first.remaining);

    let second = worker.run_batch(5).unwrap();
    assert_eq!(second.processed, 5);
    assert!(second.remaining);

    let third = worker.run_batch(5).unwrap();
    assert_eq!(third.processed, 2);
    assert!(!third.remaining);

    let fourth = worker.run_batch(5).unwrap();
    assert_eq!(fourth.processed, 0);
    assert!(!fourth.remaining);

    assert_eq!(fixture.app.embeddings.len(), 12);
    let mut ids: Vec<u64> = [first, second, third]
        .iter()
        .flat_map(|r| r.details.iter().map(|d| d.id))
        .collect();
    ids.sort();
    assert_eq!(ids, (1..=12).collect::<Vec<_>>());
}

#[test]
fn test_embeddings_survive_restart() {
    let (products, images) = catalog_with_images(3);
    let fixture = Fixture::new(products, vec![], images.clone());
    assert_eq!(fixture.app.backfill.run_batch(10).unwrap().success, 3);

    let restarted = fixture.restart(images);
    assert_eq!(restarted.embeddings.len(), 3);
    assert_eq!(restarted.backfill.pending().unwrap(), 0);
    assert_eq!(restarted.backfill.run_batch(10).unwrap().processed, 0);
}

#[test]
fn test_new_primary_image_is_reembedded() {
    let (products, mut images) = catalog_with_images(3);
    let new_url = "https://cdn.test/2-v2.png";
    images.insert(new_url.to_string(), create_solid_png(16, 16, [0, 0, 255]));
    let fixture = Fixture::new(products, vec![], images);
    fixture.app.backfill.run_batch(10).unwrap();
    let before = fixture.app.embeddings.embedding(2).unwrap();

    fixture
        .catalog
        .products
        .write()
        .unwrap()
        .iter_mut()
        .filter(|p| p.id == 2)
        .for_each(|p| p.image_urls = vec![new_url.to_string()]);

    assert_eq!(fixture.app.backfill.pending().unwrap(), 1);
    let report = fixture.app.backfill.run_batch(10).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.details[0].id, 2);
    assert_eq!(report.details[0].status, ItemStatus::Success);

    let updated = fixture.catalog.product(2).unwrap().unwrap();
    assert!(fixture
        .app
        .embeddings
        .is_current(2, image_fingerprint(updated.primary_image().unwrap())));
    assert_ne!(fixture.app.embeddings.embedding(2).unwrap(), before);
}

#[test]
fn test_unreachable_image_reported_per_item() {
    let (mut products, images) = catalog_with_images(2);
    products.push(product(3, "Ghost", &["https://cdn.test/missing.png"]));
    let fixture = Fixture::new(products, vec![], images);

    let report = fixture.app.backfill.run_batch(10).unwrap();
    assert_eq!((report.processed, report.success, report.failed), (3, 2, 1));
    let ghost = report.details.iter().find(|d| d.id == 3).unwrap();
    assert_eq!(ghost.status, ItemStatus::Failed);
    assert!(ghost.error.is_some());
}
