use strata_core::{BlockConfig, DType, MAX_LENGTH};

#[test]
fn test_config_defaults() {
    let config: BlockConfig = serde_json::from_str(
        r#"{"hidden_size": 64, "num_attention_heads": 4, "intermediate_size": 128}"#,
    )
    .unwrap();
    assert_eq!(config.head_dim(), 16);
    assert_eq!(config.max_length, MAX_LENGTH);
    assert_eq!(config.dtype, DType::F32);
    assert!((config.rms_norm_eps - 1e-5).abs() < f32::EPSILON);
    config.validate().unwrap();
}

#[test]
fn test_config_rejects_uneven_heads() {
    let config: BlockConfig = serde_json::from_str(
        r#"{"hidden_size": 10, "num_attention_heads": 4, "intermediate_size": 16}"#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_rejects_odd_head_dim() {
    let config: BlockConfig = serde_json::from_str(
        r#"{"hidden_size": 6, "num_attention_heads": 2, "intermediate_size": 16}"#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_dtype_parsing_and_sizes() {
    let dtype: DType = serde_json::from_str("\"bf16\"").unwrap();
    assert_eq!(dtype, DType::BF16);
    assert_eq!(DType::F32.size_in_bytes(), 4);
    assert_eq!(DType::F16.size_in_bytes(), 2);
}
