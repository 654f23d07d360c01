use flux_lora_transcoder::weight_io::{load_weights, save_weights};
use flux_lora_transcoder::{StorageDtype, WeightSet};
use ndarray::{arr0, Array};
use std::process::Command;
use std::str;
use tempfile::tempdir;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lora_transcoder_cli"))
}

fn write_rank_4_lora(path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut input = WeightSet::new();
    input.insert(
        "lora_unet_double_blocks_0_img_attn_proj.lora_down.weight".into(),
        Array::from_shape_fn((4, 6), |(i, j)| (i + j) as f32).into_dyn(),
    );
    input.insert(
        "lora_unet_double_blocks_0_img_attn_proj.lora_up.weight".into(),
        Array::from_shape_fn((6, 4), |(i, j)| i as f32 - j as f32).into_dyn(),
    );
    input.insert("lora_unet_double_blocks_0_img_attn_proj.alpha".into(), arr0(4.0f32).into_dyn());
    save_weights(&input, path, StorageDtype::F32)?;
    Ok(())
}

#[test]
fn test_cli_help_message() {
    let output = cli().arg("--help").output().expect("Failed to execute --help command");

    assert!(output.status.success(), "CLI --help exited with error: {:?}", output);
    let stdout = str::from_utf8(&output.stdout).expect("stdout is not valid UTF-8");
    assert!(stdout.contains("Usage:"), "Help message should contain 'Usage:'");
    assert!(stdout.contains("--input-path"), "Help message should mention --input-path");
    assert!(stdout.contains("--min-rank"), "Help message should mention --min-rank");
}

#[test]
fn test_cli_missing_required_args() {
    let output = cli()
        .args(["--input-path", "comfy_lora.safetensors"])
        .output()
        .expect("Failed to execute command with missing --output-path");

    assert!(!output.status.success(), "CLI should fail when --output-path is missing");
    let stderr = str::from_utf8(&output.stderr).expect("stderr is not valid UTF-8");
    assert!(
        stderr.contains("--output-path <OUTPUT_PATH>"),
        "Stderr should mention missing --output-path. Stderr: {}",
        stderr
    );
}

#[test]
fn test_cli_converts_and_pads() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input_path = dir.path().join("comfy_lora.safetensors");
    let output_path = dir.path().join("nested").join("diffusers_lora.safetensors");
    write_rank_4_lora(&input_path)?;

    let output = cli()
        .arg("-i")
        .arg(&input_path)
        .arg("-o")
        .arg(&output_path)
        .args(["--min-rank", "8", "--dtype", "f16"])
        .output()?;
    assert!(output.status.success(), "CLI conversion failed: {:?}", output);

    let archive = load_weights(&output_path)?;
    assert_eq!(archive.dtype, StorageDtype::F16);
    let a = &archive.tensors["transformer.transformer_blocks.0.attn.to_out.0.lora_A.weight"];
    let b = &archive.tensors["transformer.transformer_blocks.0.attn.to_out.0.lora_B.weight"];
    assert_eq!(a.shape(), &[8, 6]);
    assert_eq!(b.shape(), &[6, 8]);
    assert_eq!(archive.tensors.len(), 2);
    Ok(())
}

#[test]
fn test_cli_reports_unrecognized_keys() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input_path = dir.path().join("text_encoder_lora.safetensors");
    let output_path = dir.path().join("out.safetensors");

    let mut input = WeightSet::new();
    input.insert(
        "lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight".into(),
        Array::<f32, _>::zeros((2, 2)).into_dyn(),
    );
    save_weights(&input, &input_path, StorageDtype::F32)?;

    let output = cli().arg("-i").arg(&input_path).arg("-o").arg(&output_path).output()?;
    assert!(!output.status.success(), "CLI should fail on unrecognized keys");
    assert_eq!(output.status.code(), Some(1));
    let stderr = str::from_utf8(&output.stderr)?;
    assert!(stderr.contains("Application error:"), "Stderr: {}", stderr);
    assert!(stderr.contains("Unrecognized key pattern"), "Stderr: {}", stderr);
    assert!(!output_path.exists());
    Ok(())
}
