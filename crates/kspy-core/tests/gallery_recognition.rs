//! Training → gallery → still-image recognition, end to end with a fake
//! model that "recognizes" a face by the colour at the image centre.

use image::{Rgb, RgbImage};
use kspy_core::{
    Annotator, DetectorBackend, Embedding, FaceBox, FaceModels, Gallery, GalleryBuilder, GalleryError, Identity,
    ModelError, StillImagePipeline, VoteMatcher,
};
use std::path::Path;
use std::sync::Arc;

const ALICE: Rgb<u8> = Rgb([255, 0, 0]);
const BOB: Rgb<u8> = Rgb([0, 255, 0]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Non-black centre pixel means one face; its colour is the embedding.
struct ColorModels;

impl FaceModels for ColorModels {
    fn detect(&self, image: &RgbImage, _: DetectorBackend) -> Result<Vec<FaceBox>, ModelError> {
        let (w, h) = image.dimensions();
        if *image.get_pixel(w / 2, h / 2) == BLACK {
            return Ok(Vec::new());
        }
        Ok(vec![FaceBox::new(4, w as i32 - 5, h as i32 - 5, 4)])
    }

    fn encode(&self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>, ModelError> {
        let (w, h) = image.dimensions();
        let Rgb([r, g, b]) = *image.get_pixel(w / 2, h / 2);
        let values = vec![r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0];
        Ok(boxes.iter().map(|_| Embedding::new(values.clone())).collect())
    }
}

fn portrait(color: Rgb<u8>) -> RgbImage {
    let mut img = RgbImage::from_pixel(96, 96, BLACK);
    for y in 32..64 {
        for x in 32..64 {
            img.put_pixel(x, y, color);
        }
    }
    img
}

fn write_image(root: &Path, rel: &str, img: &RgbImage) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    img.save(path).unwrap();
}

fn build(root: &Path) -> Result<Gallery, GalleryError> {
    GalleryBuilder::new(&ColorModels, DetectorBackend::Fast)
        .build(root)
        .map(|(gallery, _)| gallery)
}

#[test]
fn test_train_two_people() {
    let dir = tempfile::tempdir().unwrap();
    let training = dir.path().join("training");
    write_image(&training, "alice/1.png", &portrait(ALICE));
    write_image(&training, "bob/1.png", &portrait(BOB));

    let (gallery, stats) = GalleryBuilder::new(&ColorModels, DetectorBackend::Fast)
        .build(&training)
        .unwrap();

    assert_eq!(gallery.names(), ["alice", "bob"]);
    assert_eq!(gallery.encodings().len(), 2);
    assert_eq!(stats.labels, 2);
    assert_eq!(stats.images, 2);
    assert_eq!(stats.faces, 2);
    assert_eq!(stats.empty_images, 0);
}

#[test]
fn test_build_order_is_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(root, "zed/1.png", &portrait(BOB));
    write_image(root, "alice/2.png", &portrait(Rgb([200, 0, 0])));
    write_image(root, "alice/1.png", &portrait(ALICE));

    let gallery = build(root).unwrap();
    assert_eq!(gallery.names(), ["alice", "alice", "zed"]);
    assert_eq!(gallery.encodings()[0].values[0], 1.0);
    assert!(gallery.encodings()[1].values[0] < 1.0);
}

#[test]
fn test_images_without_faces_contribute_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(root, "alice/1.png", &portrait(ALICE));
    write_image(root, "alice/empty.png", &RgbImage::from_pixel(96, 96, BLACK));

    let (gallery, stats) = GalleryBuilder::new(&ColorModels, DetectorBackend::Fast)
        .build(root)
        .unwrap();
    assert_eq!(gallery.len(), 1);
    assert_eq!(stats.images, 2);
    assert_eq!(stats.empty_images, 1);
}

#[test]
fn test_unreadable_training_image_aborts_build() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(root, "alice/1.png", &portrait(ALICE));
    std::fs::write(root.join("alice/2.png"), b"truncated").unwrap();

    let err = build(root).unwrap_err();
    assert!(matches!(err, GalleryError::Image { ref path, .. } if path.ends_with("alice/2.png")));
}

#[test]
fn test_saved_gallery_recognizes_faces() {
    let dir = tempfile::tempdir().unwrap();
    let training = dir.path().join("training");
    write_image(&training, "alice/1.png", &portrait(ALICE));
    write_image(&training, "bob/1.png", &portrait(BOB));

    let gallery_path = dir.path().join("output/encodings.bin");
    build(&training).unwrap().save(&gallery_path).unwrap();
    let gallery = Gallery::load(&gallery_path).unwrap();

    let pipeline = StillImagePipeline::new(
        Arc::new(ColorModels),
        Arc::new(gallery),
        VoteMatcher::default(),
        Arc::new(Annotator::new(None)),
    );

    let analysis = pipeline.analyze(&portrait(ALICE), DetectorBackend::Fast).unwrap();
    assert_eq!(analysis.faces.len(), 1);
    assert_eq!(analysis.faces[0].identity, Identity::Known("alice".into()));

    let stranger = pipeline
        .analyze(&portrait(Rgb([0, 0, 255])), DetectorBackend::Fast)
        .unwrap();
    assert_eq!(stranger.faces[0].identity, Identity::Unknown);

    let blank = RgbImage::from_pixel(96, 96, BLACK);
    let analysis = pipeline.analyze(&blank, DetectorBackend::Fast).unwrap();
    assert!(analysis.faces.is_empty());
    assert_eq!(analysis.image, blank);
}

#[test]
fn test_missing_gallery_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = Gallery::load(&dir.path().join("output/encodings.bin")).unwrap_err();
    assert!(matches!(err, GalleryError::NotFound(_)));
}
