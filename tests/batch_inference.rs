use std::path::Path;

use anyhow::Result;
use image::{ImageFormat, RgbImage};
use tempfile::TempDir;

use detkit::{
    gather_images, run_batch, run_single, run_single_with, BackendRegistry, InferOptions,
    StubBackend,
};

fn write_image(path: &Path, format: ImageFormat) -> Result<()> {
    let img = RgbImage::from_pixel(48, 32, image::Rgb([40, 80, 120]));
    img.save_with_format(path, format)?;
    Ok(())
}

fn options(outdir: &Path) -> InferOptions {
    InferOptions {
        imgsz: 64,
        conf: 0.25,
        device: "cpu".to_string(),
        outdir: outdir.to_path_buf(),
    }
}

#[test]
fn gathers_images_case_insensitively_in_name_order() -> Result<()> {
    let dir = TempDir::new()?;
    write_image(&dir.path().join("b.JPG"), ImageFormat::Jpeg)?;
    write_image(&dir.path().join("a.png"), ImageFormat::Png)?;
    std::fs::write(dir.path().join("c.txt"), b"not an image")?;
    std::fs::create_dir(dir.path().join("d.png"))?;

    let paths = gather_images(dir.path())?;
    let names: Vec<&str> = paths
        .iter()
        .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap())
        .collect();
    assert_eq!(names, vec!["a.png", "b.JPG"]);
    Ok(())
}

#[test]
fn batch_writes_positional_outputs() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    write_image(&input.path().join("a.png"), ImageFormat::Png)?;
    write_image(&input.path().join("b.JPG"), ImageFormat::Jpeg)?;
    std::fs::write(input.path().join("c.txt"), b"not an image")?;

    let stub = StubBackend::new();
    let calls = stub.calls();
    let mut registry = BackendRegistry::new();
    registry.register(stub);

    let paths = gather_images(input.path())?;
    let outdir = output.path().join("results");
    let mut seen = Vec::new();
    let summary = run_batch(&registry, &paths, &options(&outdir), |p| {
        seen.push(p.to_path_buf())
    })?;

    assert_eq!(
        summary.written,
        vec![outdir.join("result_0.jpg"), outdir.join("result_1.jpg")]
    );
    assert!(summary.skipped.is_empty());
    assert_eq!(seen, paths);
    for out in &summary.written {
        let annotated = image::open(out)?;
        assert_eq!((annotated.width(), annotated.height()), (64, 64));
    }
    assert_eq!(calls.lock().unwrap().predictions.len(), 2);
    Ok(())
}

#[test]
fn empty_directory_writes_nothing() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    std::fs::write(input.path().join("notes.txt"), b"nothing to see")?;

    let paths = gather_images(input.path())?;
    assert!(paths.is_empty());

    let stub = StubBackend::new();
    let calls = stub.calls();
    let mut registry = BackendRegistry::new();
    registry.register(stub);
    let outdir = output.path().join("results");
    let summary = run_batch(&registry, &paths, &options(&outdir), |_| {})?;

    assert!(summary.written.is_empty());
    assert!(!outdir.exists());
    assert!(calls.lock().unwrap().predictions.is_empty());
    Ok(())
}

#[test]
fn batch_skips_undecodable_images() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    std::fs::write(input.path().join("a.jpg"), b"definitely not a jpeg")?;
    write_image(&input.path().join("b.png"), ImageFormat::Png)?;

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());
    let paths = gather_images(input.path())?;
    let summary = run_batch(&registry, &paths, &options(output.path()), |_| {})?;

    assert_eq!(summary.skipped, vec![input.path().join("a.jpg")]);
    // The index follows the gathered position, so the only output is result_1.
    assert_eq!(summary.written, vec![output.path().join("result_1.jpg")]);
    assert!(!output.path().join("result_0.jpg").exists());
    Ok(())
}

#[test]
fn single_mode_fails_on_corrupt_image_before_predicting() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    let corrupt = input.path().join("broken.png");
    std::fs::write(&corrupt, b"\x89PNG garbage")?;

    let stub = StubBackend::new();
    let calls = stub.calls();
    let mut registry = BackendRegistry::new();
    registry.register(stub);

    let err = run_single(&registry, &corrupt, &options(output.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("cannot load"));
    assert!(calls.lock().unwrap().predictions.is_empty());
    assert!(!output.path().join("result_0.jpg").exists());
    Ok(())
}

#[test]
fn single_mode_writes_result_zero() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    let source = input.path().join("frame.bmp");
    write_image(&source, ImageFormat::Bmp)?;

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());
    let outdir = output.path().join("out");
    let out = run_single(&registry, &source, &options(&outdir))?;

    assert_eq!(out, outdir.join("result_0.jpg"));
    assert!(out.exists());
    Ok(())
}

#[test]
fn single_mode_decodes_before_loading_backends() -> Result<()> {
    let input = TempDir::new()?;
    let output = TempDir::new()?;
    let corrupt = input.path().join("broken.jpg");
    std::fs::write(&corrupt, b"not a jpeg")?;

    let mut loaded = false;
    let err = run_single_with(&corrupt, &options(output.path()), || {
        loaded = true;
        Ok(BackendRegistry::new())
    })
    .unwrap_err();
    assert!(format!("{:#}", err).contains("cannot load"));
    assert!(!loaded);
    assert!(!output.path().exists() || std::fs::read_dir(output.path())?.next().is_none());

    let source = input.path().join("frame.png");
    write_image(&source, ImageFormat::Png)?;
    let out = run_single_with(&source, &options(output.path()), || {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        Ok(registry)
    })?;
    assert_eq!(out, output.path().join("result_0.jpg"));
    assert!(out.is_file());
    Ok(())
}
