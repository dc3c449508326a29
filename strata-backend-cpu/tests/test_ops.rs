use strata_backend_cpu::CpuBackend;
use strata_core::{Backend, DType, Tensor};

#[test]
fn test_matmul_2x3_times_3x2() {
    let backend = CpuBackend::new();
    let a = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap();
    let b = backend
        .copy_from_host_f32(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])
        .unwrap();
    let c = backend.matmul(&a, &b).unwrap();
    assert_eq!(c.shape(), &[2, 2]);
    assert_eq!(
        backend.copy_to_host_f32(&c).unwrap(),
        vec![58.0, 64.0, 139.0, 154.0]
    );
}

#[test]
fn test_matmul_shape_mismatch() {
    let backend = CpuBackend::new();
    let a = backend.copy_from_host_f32(&[1.0, 2.0], &[1, 2]).unwrap();
    let b = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0], &[1, 3])
        .unwrap();
    assert!(backend.matmul(&a, &b).is_err());
}

#[test]
fn test_copy_from_host_rejects_bad_shape() {
    let backend = CpuBackend::new();
    assert!(backend.copy_from_host_f32(&[1.0, 2.0, 3.0], &[2, 2]).is_err());
}

#[test]
fn test_add_and_mul() {
    let backend = CpuBackend::new();
    let a = backend.copy_from_host_f32(&[1.0, 2.0, 3.0], &[3]).unwrap();
    let b = backend.copy_from_host_f32(&[4.0, 5.0, 6.0], &[3]).unwrap();
    let sum = backend.add(&a, &b).unwrap();
    assert_eq!(backend.copy_to_host_f32(&sum).unwrap(), vec![5.0, 7.0, 9.0]);
    let prod = backend.mul(&a, &b).unwrap();
    assert_eq!(backend.copy_to_host_f32(&prod).unwrap(), vec![4.0, 10.0, 18.0]);
}

#[test]
fn test_silu() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[0.0, 1.0, -1.0], &[3])
        .unwrap();
    let out = backend.silu(&x).unwrap();
    let result = backend.copy_to_host_f32(&out).unwrap();
    assert!((result[0] - 0.0).abs() < 1e-4);
    assert!((result[1] - 0.7311).abs() < 1e-3);
    assert!((result[2] - (-0.2689)).abs() < 1e-3);
}

#[test]
fn test_fused_silu_mul_matches_unfused() {
    let backend = CpuBackend::new();
    let gate = backend.copy_from_host_f32(&[0.5, -2.0, 3.0], &[3]).unwrap();
    let up = backend.copy_from_host_f32(&[2.0, 1.0, -1.0], &[3]).unwrap();
    let fused = backend.fused_silu_mul(&gate, &up).unwrap();
    let unfused = backend.mul(&backend.silu(&gate).unwrap(), &up).unwrap();
    let a = backend.copy_to_host_f32(&fused).unwrap();
    let b = backend.copy_to_host_f32(&unfused).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn test_rms_norm() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 4])
        .unwrap();
    let w = backend
        .copy_from_host_f32(&[1.0, 1.0, 1.0, 1.0], &[4])
        .unwrap();
    let out = backend.rms_norm(&x, &w, 1e-5).unwrap();
    let result = backend.copy_to_host_f32(&out).unwrap();
    let rms = (7.5f32).sqrt();
    let expected: Vec<f32> = vec![1.0 / rms, 2.0 / rms, 3.0 / rms, 4.0 / rms];
    for (a, b) in result.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-4, "got {a}, expected {b}");
    }
}

#[test]
fn test_softmax_multi_row() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0], &[2, 3])
        .unwrap();
    let out = backend.softmax(&x, -1).unwrap();
    let result = backend.copy_to_host_f32(&out).unwrap();
    let sum0: f32 = result[..3].iter().sum();
    let sum1: f32 = result[3..].iter().sum();
    assert!((sum0 - 1.0).abs() < 1e-5, "row 0 sum={sum0}");
    assert!((sum1 - 1.0).abs() < 1e-5, "row 1 sum={sum1}");
    assert!(result[2] > result[1] && result[1] > result[0]);
}

#[test]
fn test_softmax_rejects_inner_dim() {
    let backend = CpuBackend::new();
    let x = backend.copy_from_host_f32(&[1.0; 6], &[2, 3]).unwrap();
    assert!(backend.softmax(&x, 0).is_err());
}

#[test]
fn test_transpose_and_reshape() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap();
    let y = backend.transpose(&x, 0, 1).unwrap();
    assert_eq!(y.shape(), &[3, 2]);
    assert_eq!(
        backend.copy_to_host_f32(&y).unwrap(),
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
    );
    let z = backend.reshape(&x, &[3, 2]).unwrap();
    assert_eq!(z.shape(), &[3, 2]);
    assert!(backend.reshape(&x, &[4, 2]).is_err());
}

#[test]
fn test_cat_3d() {
    let backend = CpuBackend::new();
    let a = backend.copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2]).unwrap();
    let b = backend.copy_from_host_f32(&[5.0, 6.0, 7.0, 8.0], &[1, 2, 2]).unwrap();
    let c = backend.cat(&[&a, &b], 0).unwrap();
    assert_eq!(c.shape(), &[2, 2, 2]);
    assert_eq!(
        backend.copy_to_host_f32(&c).unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
    );

    let odd = backend.copy_from_host_f32(&[1.0, 2.0, 3.0], &[1, 3, 1]).unwrap();
    assert!(backend.cat(&[&a, &odd], 0).is_err());
}

#[test]
fn test_rope_identity_and_offset() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 1, 4])
        .unwrap();
    // Row 0 is the identity rotation, row 1 rotates by 90 degrees.
    let cos = backend
        .copy_from_host_f32(&[1.0, 1.0, 0.0, 0.0], &[2, 2])
        .unwrap();
    let sin = backend
        .copy_from_host_f32(&[0.0, 0.0, 1.0, 1.0], &[2, 2])
        .unwrap();

    let out = backend.rope(&x, &cos, &sin, 0).unwrap();
    assert_eq!(backend.copy_to_host_f32(&out).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let out = backend.rope(&x, &cos, &sin, 1).unwrap();
    assert_eq!(
        backend.copy_to_host_f32(&out).unwrap(),
        vec![-3.0, -4.0, 1.0, 2.0]
    );

    assert!(backend.rope(&x, &cos, &sin, 2).is_err());
}

#[test]
fn test_write_rows_in_place() {
    let backend = CpuBackend::new();
    let mut dst = backend.allocate_zeros(&[4, 2], DType::F32).unwrap();
    let snapshot = dst.clone();
    let src = backend.copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();

    backend.write_rows(&mut dst, 1, &src).unwrap();
    assert_eq!(
        backend.copy_to_host_f32(&dst).unwrap(),
        vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.0]
    );
    // Earlier clones keep their own data.
    assert_eq!(backend.copy_to_host_f32(&snapshot).unwrap(), vec![0.0; 8]);

    assert!(backend.write_rows(&mut dst, 3, &src).is_err());
    let wide = backend.copy_from_host_f32(&[1.0; 3], &[1, 3]).unwrap();
    assert!(backend.write_rows(&mut dst, 0, &wide).is_err());
}

#[test]
fn test_slice_rows() {
    let backend = CpuBackend::new();
    let x = backend
        .copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2])
        .unwrap();
    let y = backend.slice_rows(&x, 1, 2).unwrap();
    assert_eq!(y.shape(), &[2, 2]);
    assert_eq!(backend.copy_to_host_f32(&y).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    assert!(backend.slice_rows(&x, 2, 2).is_err());
}

#[test]
fn test_causal_attention_first_token_sees_only_itself() {
    let backend = CpuBackend::new();
    // One head, head_dim 2, two positions with distinct values.
    let q = backend.copy_from_host_f32(&[1.0, 0.0, 1.0, 0.0], &[1, 2, 1, 2]).unwrap();
    let k = backend.copy_from_host_f32(&[1.0, 0.0, 1.0, 0.0], &[1, 2, 1, 2]).unwrap();
    let v = backend.copy_from_host_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 1, 2]).unwrap();

    let out = backend
        .multi_head_attention(&q, &k, &v, 1, 1, 2, 1.0, true)
        .unwrap();
    assert_eq!(out.shape(), &[2, 2]);
    let result = backend.copy_to_host_f32(&out).unwrap();
    assert!((result[0] - 1.0).abs() < 1e-5);
    assert!((result[1] - 2.0).abs() < 1e-5);
    // Equal scores for the second query: average of both values.
    assert!((result[2] - 2.0).abs() < 1e-5);
    assert!((result[3] - 3.0).abs() < 1e-5);
}

#[test]
fn test_attention_rejects_more_queries_than_keys() {
    let backend = CpuBackend::new();
    let q = backend.copy_from_host_f32(&[1.0; 4], &[1, 2, 1, 2]).unwrap();
    let k = backend.copy_from_host_f32(&[1.0; 2], &[1, 1, 1, 2]).unwrap();
    assert!(backend
        .multi_head_attention(&q, &k, &k, 1, 1, 2, 1.0, true)
        .is_err());
}
