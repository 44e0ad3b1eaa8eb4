use mlblock_core::{DType, MlbError, Shape};
use mlblock_io::{LocalTensor, MemoryStore, SafeTensorStore, TensorStore, save_safetensors};

#[test]
fn roundtrip_f32_through_mmap_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.safetensors");

    let data = vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let t = LocalTensor::from_f32([2, 3], &data).unwrap();
    save_safetensors(&path, [("weight", &t)]).unwrap();

    let store = SafeTensorStore::open(&path).unwrap();
    assert_eq!(store.len(), 1);
    let info = store.info("weight").unwrap();
    assert_eq!(info.shape, Shape::from([2, 3]));
    assert_eq!(info.dtype, DType::F32);

    let mut dst = vec![0u8; info.byte_len()];
    store.read("weight", &mut dst).unwrap();
    assert_eq!(dst, t.as_bytes());
}

#[test]
fn roundtrip_keeps_half_precision_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("half.safetensors");

    let store = MemoryStore::new()
        .with(
            "enc.weight",
            LocalTensor::from_f32_as(DType::F16, [2, 2], &[0.5, -1.0, 2.0, 4.0]).unwrap(),
        )
        .with(
            "enc.bias",
            LocalTensor::from_f32_as(DType::BF16, [2], &[1.0, 3.0]).unwrap(),
        );
    store.save(&path).unwrap();

    let loaded = MemoryStore::from_safetensors(&path).unwrap();
    assert_eq!(loaded.keys(), vec!["enc.bias", "enc.weight"]);
    assert_eq!(loaded.get("enc.weight"), store.get("enc.weight"));
    assert_eq!(loaded.get("enc.bias").unwrap().dtype(), DType::BF16);
    assert_eq!(
        loaded.get("enc.bias").unwrap().to_f32().unwrap(),
        vec![1.0, 3.0]
    );
}

#[test]
fn missing_key_is_reported_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.safetensors");
    let t = LocalTensor::from_f32([1], &[1.0]).unwrap();
    save_safetensors(&path, [("a", &t)]).unwrap();

    let store = SafeTensorStore::open(&path).unwrap();
    assert!(store.info("x.y").is_none());
    let err = store.read("x.y", &mut [0u8; 4]).unwrap_err();
    assert!(matches!(err, MlbError::MissingKey(ref k) if k == "x.y"));
}

#[test]
fn open_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.safetensors");
    std::fs::write(&path, b"definitely not safetensors").unwrap();
    assert!(matches!(
        SafeTensorStore::open(&path),
        Err(MlbError::Store(_))
    ));
}
