//! Command-line interface
//!
//! Maps parsed flags onto [`FinetuneOptions`] and runs the pipeline.

use anyhow::Result;
use std::path::PathBuf;

use crate::pipeline::{self, FinetuneOptions};
use crate::training::DevicePreference;

/// Interpret a boolean flag value
///
/// The empty string, false, 0, no and off (in any case) disable the flag.
/// Every other value enables it.
pub fn parse_bool_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "" | "false" | "0" | "no" | "off"
    )
}

/// Execute the fine-tune command
#[allow(clippy::too_many_arguments)]
pub fn finetune(
    model: String,
    train: String,
    val: String,
    hnm: bool,
    project_dir: Option<PathBuf>,
    device: DevicePreference,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    seed: Option<u64>,
) -> Result<()> {
    let options = FinetuneOptions {
        project_dir: project_dir.unwrap_or_else(|| PathBuf::from(".")),
        device,
        epochs,
        batch_size,
        learning_rate,
        seed,
        ..FinetuneOptions::new(model, train, val, hnm)
    };

    let output = pipeline::run(&options)?;

    println!("\n=== Fine-tuning complete ===");
    println!("Steps: {}", output.global_step);
    println!("Training loss: {:.4}", output.training_loss);
    if let (Some(path), Some(metric)) = (&output.best_checkpoint, output.best_metric) {
        println!("Best checkpoint: {} ({:.4})", path.display(), metric);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_flag() {
        for v in ["true", "True", "1", "yes", "ON"] {
            assert!(parse_bool_flag(v), "{v}");
        }
        for v in ["false", "FALSE", "0", "no", "off", "", "  "] {
            assert!(!parse_bool_flag(v), "{v:?}");
        }
    }

    #[test]
    fn test_parse_bool_flag_other_values_enable() {
        for v in ["maybe", "2", "False!", "enabled"] {
            assert!(parse_bool_flag(v), "{v}");
        }
    }
}
