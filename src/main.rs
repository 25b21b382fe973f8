use clap::Parser;
use std::path::PathBuf;

use embedtune::cli;
use embedtune::training::DevicePreference;

#[derive(Parser)]
#[command(name = "embedtune")]
#[command(about = "Fine-tune a sentence embedding model for retrieval", long_about = None)]
#[command(version)]
struct Cli {
    /// Model name under <project>/model, or a HuggingFace model ID
    #[arg(long)]
    model: String,

    /// Training dataset file under <project>/data
    #[arg(long)]
    train: String,

    /// Validation dataset file under <project>/data
    #[arg(long)]
    val: String,

    /// Mine hard negatives before training (false/0/no/off disable it)
    #[arg(long, required = true, action = clap::ArgAction::Set, value_parser = parse_hnm)]
    hnm: bool,

    /// Project directory containing model/ and data/
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    device: DevicePreference,

    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Per-device train batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_hnm(value: &str) -> Result<bool, String> {
    Ok(cli::parse_bool_flag(value))
}

fn main() -> anyhow::Result<()> {
    embedtune::utils::init_logging();

    let cli = Cli::parse();

    cli::finetune(
        cli.model,
        cli.train,
        cli.val,
        cli.hnm,
        cli.project_dir,
        cli.device,
        cli.epochs,
        cli.batch_size,
        cli.learning_rate,
        cli.seed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    const REQUIRED: [(&str, &str); 4] = [
        ("--model", "bge-small"),
        ("--train", "train.json"),
        ("--val", "val.json"),
        ("--hnm", "true"),
    ];

    fn argv(skip: Option<&str>, hnm: &str) -> Vec<String> {
        let mut argv = vec!["embedtune".to_string()];
        for (flag, value) in REQUIRED {
            if Some(flag) == skip {
                continue;
            }
            argv.push(flag.to_string());
            argv.push(if flag == "--hnm" { hnm } else { value }.to_string());
        }
        argv
    }

    #[test]
    fn test_each_flag_is_required() {
        for (flag, _) in REQUIRED {
            let err = Cli::try_parse_from(argv(Some(flag), "true"))
                .err()
                .unwrap_or_else(|| panic!("{flag} should be required"));
            assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument, "{flag}");
        }
    }

    #[test]
    fn test_hnm_takes_a_value() {
        let cli = Cli::try_parse_from(argv(None, "true")).unwrap();
        assert!(cli.hnm);
        assert_eq!(cli.model, "bge-small");
        assert_eq!(cli.train, "train.json");
        assert_eq!(cli.val, "val.json");

        let cli = Cli::try_parse_from(argv(None, "false")).unwrap();
        assert!(!cli.hnm);

        let cli = Cli::try_parse_from(argv(None, "anything")).unwrap();
        assert!(cli.hnm);
    }

    #[test]
    fn test_optional_overrides() {
        let mut args = argv(None, "0");
        args.extend(["--epochs", "3", "--device", "cpu"].map(String::from));
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(!cli.hnm);
        assert_eq!(cli.epochs, Some(3));
        assert_eq!(cli.device, DevicePreference::Cpu);
        assert!(cli.project_dir.is_none());
    }
}
