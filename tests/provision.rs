mod common;

use common::{touch, FakeFactory, FakeFetcher};
use controlnet_predictor::assets::AssetLayout;
use controlnet_predictor::{provision, ControlType, Error, Settings};

fn settings(dir: &tempfile::TempDir, offline: bool) -> Settings {
    Settings { models_dir: dir.path().to_path_buf(), offline, ..Default::default() }
}

#[test]
fn downloads_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::default();
    let factory = FakeFactory::default();
    let registry = provision(&settings(&dir, false), &fetcher, &factory).unwrap();
    assert_eq!(registry.control_types(), ControlType::ALL);
    assert!(registry.depth_estimator().is_some());
    // Six controlnet files, four base files and the depth estimator.
    assert_eq!(fetcher.urls.borrow().len(), 11);
    assert_eq!(factory.bases.get(), 1);
    assert_eq!(factory.estimators.get(), 1);

    let again = FakeFetcher::default();
    let registry = provision(&settings(&dir, false), &again, &FakeFactory::default()).unwrap();
    assert_eq!(registry.control_types(), ControlType::ALL);
    assert!(again.urls.borrow().is_empty());
}

#[test]
fn failed_download_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher { fail_on: Some("normalbae"), ..Default::default() };
    let factory = FakeFactory::default();
    let err = provision(&settings(&dir, false), &fetcher, &factory).unwrap_err();
    assert!(matches!(err, Error::AssetFetch { ref url, .. } if url.contains("normalbae")));
    assert_eq!(factory.bases.get(), 0);
    let layout = AssetLayout::new(dir.path());
    assert!(!layout.control(ControlType::Normal).weights.exists());
}

#[test]
fn offline_skips_incomplete_control_types() {
    let dir = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(dir.path());
    layout.base.files().into_iter().for_each(touch);
    layout.control(ControlType::Canny).files().into_iter().for_each(touch);
    // Only the weights, the config is missing.
    touch(&layout.control(ControlType::Depth).weights);

    let fetcher = FakeFetcher::default();
    let factory = FakeFactory::default();
    let registry = provision(&settings(&dir, true), &fetcher, &factory).unwrap();
    assert_eq!(registry.control_types(), [ControlType::Canny]);
    assert!(registry.depth_estimator().is_none());
    assert_eq!(factory.estimators.get(), 0);
    assert!(fetcher.urls.borrow().is_empty());
}

#[test]
fn offline_without_depth_estimator_keeps_canny_only() {
    let dir = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(dir.path());
    layout.base.files().into_iter().for_each(touch);
    for control in layout.controls() {
        control.files().into_iter().for_each(touch);
    }
    let factory = FakeFactory::default();
    let registry = provision(&settings(&dir, true), &FakeFetcher::default(), &factory).unwrap();
    assert_eq!(registry.control_types(), [ControlType::Canny]);
    assert_eq!(factory.built.borrow().as_slice(), [ControlType::Canny]);

    touch(&layout.depth_estimator);
    let registry = provision(&settings(&dir, true), &FakeFetcher::default(), &factory).unwrap();
    assert_eq!(registry.control_types(), ControlType::ALL);
    assert!(registry.depth_estimator().is_some());
}

#[test]
fn offline_without_base_model_fails() {
    let dir = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(dir.path());
    for control in layout.controls() {
        control.files().into_iter().for_each(touch);
    }
    let fetcher = FakeFetcher::default();
    let err = provision(&settings(&dir, true), &fetcher, &FakeFactory::default()).unwrap_err();
    let unet = AssetLayout::new(dir.path()).base.unet.path;
    assert!(matches!(err, Error::MissingAsset(ref path) if *path == unet), "{err:?}");
    assert!(err.to_string().contains("downloads are disabled"), "{err}");
    assert!(fetcher.urls.borrow().is_empty());
}
