use conduit_dtype::ElementKind;

use crate::{AlignedBytes, Error, HostArray};

#[test]
fn test_identity_is_not_content() {
    let a = HostArray::from_slice(&[1.0f32, 2.0]);
    let b = HostArray::from_slice(&[1.0f32, 2.0]);
    let alias = a.clone();

    assert_ne!(a.id(), b.id());
    assert_eq!(a.id(), alias.id());
    assert!(a.ptr_eq(&alias));
    assert!(!a.ptr_eq(&b));
}

#[test]
fn test_typed_access() {
    let array = HostArray::from_slice(&[1i64, 2, 3]);
    assert_eq!(array.len(), 3);
    assert_eq!(array.byte_len(), 24);
    assert_eq!(array.kind(), ElementKind::Int64);

    array.write::<i64, _>(|values| values[1] = 20).unwrap();
    assert_eq!(array.read::<i64, _>(|values| values.iter().sum::<i64>()).unwrap(), 24);
    assert!(matches!(array.to_vec::<u64>(), Err(Error::KindMismatch { .. })));

    array.copy_from_slice(&[7i64, 8, 9]).unwrap();
    assert_eq!(array.to_vec::<i64>().unwrap(), vec![7, 8, 9]);
    assert!(matches!(array.copy_from_slice(&[1i64]), Err(Error::SizeMismatch { expected: 3, actual: 1 })));
}

#[test]
fn test_from_bytes() {
    let flags = HostArray::from_bytes(ElementKind::Bool, &[1, 0, 1]).unwrap();
    assert_eq!(flags.len(), 3);
    assert_eq!(flags.to_bytes(), vec![1, 0, 1]);

    assert!(HostArray::from_bytes(ElementKind::Float32, &[0; 6]).is_err());
    assert!(HostArray::zeroed_kind(ElementKind::UInt16, 0).is_empty());
}

#[test]
fn test_aligned_bytes_ranges() {
    let mut bytes = AlignedBytes::zeroed(10);
    assert_eq!(bytes.len(), 10);
    bytes.range_mut(2, 3).unwrap().copy_from_slice(&[7, 8, 9]);

    assert_eq!(bytes.range(1, 5).unwrap(), &[0, 7, 8, 9, 0]);
    assert!(bytes.range(8, 3).is_err());
    assert!(bytes.range(usize::MAX, 1).is_err());
    assert_eq!(AlignedBytes::from_bytes(&[1, 2]).as_bytes(), &[1, 2]);
}
