use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgMatches, Command};
use serde::Serialize;
use uuid::Uuid;

use mosaic_preview::config::{self, ConfigError, PipelineConfig};
use mosaic_preview::db::DatabaseError;
use mosaic_preview::models::ImageVariant;
use mosaic_preview::pipeline::staging::StagingError;
use mosaic_preview::pipeline::{ConsumeError, ImageInput, OpenError, PreviewError, PreviewPipeline};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Input(#[from] StagingError),

    #[error(transparent)]
    Preview(#[from] PreviewError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Invalid preview id: {0}")]
    InvalidId(String),

    #[error("Preview not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Open(_) => "CONFIG_ERROR",
            Self::Input(_) | Self::InvalidId(_) => "INVALID_INPUT",
            Self::Preview(e) => e.kind.code(),
            Self::Consume(ConsumeError::NotFound(_)) | Self::NotFound(_) => "NOT_FOUND",
            Self::Consume(ConsumeError::AlreadyConsumed(_)) => "ALREADY_USED",
            Self::Consume(ConsumeError::Database(_)) | Self::Database(_) => "PERSIST_FAILED",
            Self::Json(_) => "INTERNAL",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

fn cli() -> Command {
    let image_arg = Arg::new("image")
        .required(true)
        .help("Image source: a data URI, an http(s) URL, or a local file path");

    Command::new(config::APP_NAME)
        .version(config::APP_VERSION)
        .about("Redact faces and license plates and store single-use previews")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("generate")
                .about("Redact an image and store both variants as a preview")
                .arg(
                    Arg::new("user")
                        .long("user")
                        .required(true)
                        .help("Owner of the new preview"),
                )
                .arg(image_arg.clone()),
        )
        .subcommand(
            Command::new("redact")
                .about("Redact an image and print both variants without storing them")
                .arg(image_arg),
        )
        .subcommand(
            Command::new("show")
                .about("Print a stored preview")
                .arg(Arg::new("preview-id").required(true).help("Preview UUID")),
        )
        .subcommand(
            Command::new("consume")
                .about("Mark a preview as used and print the selected variant")
                .arg(Arg::new("preview-id").required(true).help("Preview UUID"))
                .arg(
                    Arg::new("variant")
                        .long("variant")
                        .default_value("AUTO")
                        .value_parser(["AUTO", "PLATE_VISIBLE", "auto", "plate"])
                        .help("Which redacted image the post binds to"),
                ),
        )
}

fn arg<'a>(args: &'a ArgMatches, name: &str) -> &'a str {
    // Every positional here is `required`, so clap guarantees presence.
    args.get_one::<String>(name).map(String::as_str).unwrap_or_default()
}

fn image_input(reference: &str) -> Result<ImageInput, CliError> {
    let trimmed = reference.trim();
    if trimmed.starts_with("data:") || trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(ImageInput::parse_reference(trimmed)?);
    }
    Ok(ImageInput::File(PathBuf::from(trimmed)))
}

fn preview_id(raw: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(raw.trim()).map_err(|_| CliError::InvalidId(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(matches: ArgMatches) -> Result<(), CliError> {
    let config = PipelineConfig::from_env()?;
    let pipeline = PreviewPipeline::open(config)?;

    match matches.subcommand() {
        Some(("generate", args)) => {
            let input = image_input(arg(args, "image"))?;
            pipeline.sweep_stale_staging();
            let outcome = pipeline.generate_preview(arg(args, "user"), input).await?;
            print_json(&outcome)
        }
        Some(("redact", args)) => {
            let input = image_input(arg(args, "image"))?;
            pipeline.sweep_stale_staging();
            let images = pipeline.redact_image(input).await?;
            print_json(&images)
        }
        Some(("show", args)) => {
            let id = preview_id(arg(args, "preview-id"))?;
            let preview = pipeline.lookup_preview(id).await?.ok_or(CliError::NotFound(id))?;
            print_json(&preview)
        }
        Some(("consume", args)) => {
            let id = preview_id(arg(args, "preview-id"))?;
            let variant = ImageVariant::from_selection(args.get_one::<String>("variant").map(String::as_str));
            let consumed = pipeline.consume_preview(id, variant).await?;
            print_json(&consumed)
        }
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    mosaic_preview::init_tracing();
    tracing::debug!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let matches = cli().get_matches();
    match run(matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let body = ErrorBody {
                error: e.code(),
                message: e.to_string(),
            };
            match serde_json::to_string_pretty(&body) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{}: {}", body.error, body.message),
            }
            ExitCode::FAILURE
        }
    }
}
