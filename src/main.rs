use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ppmi_downloader::config::{load_credentials, DEFAULT_CREDENTIALS_FILE};
use ppmi_downloader::reconcile::default_measures;
use ppmi_downloader::router::archive_members;
use ppmi_downloader::{
    logging, ChannelMapping, CheckboxCatalog, ImageFormat, Logger, NiftiFinder, Reconciler,
    Session, Settings,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "PPMI_SETTINGS")]
    settings: Option<PathBuf>,

    /// Credentials file
    #[arg(long, default_value = DEFAULT_CREDENTIALS_FILE)]
    credentials: PathBuf,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Path to the Chrome executable
    #[arg(long)]
    chrome_path: Option<String>,

    /// Launch Chrome without its sandbox (containers)
    #[arg(long)]
    no_sandbox: bool,

    /// Use a Chrome already listening on this debug port
    #[arg(long)]
    debug_port: Option<u16>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download study-data files by name
    Metadata {
        /// Guessed or real file names, e.g. Demographics.csv
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(short, long, default_value = ".")]
        destination: PathBuf,
        /// Download timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Download images and image metadata for subjects
    Imaging {
        #[arg(required = true)]
        subjects: Vec<String>,
        #[arg(short, long, default_value = ".")]
        destination: PathBuf,
        #[arg(long, value_enum, default_value_t = FormatArg::Archived)]
        format: FormatArg,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Download the listing of available 3D T1 scans
    T1Info {
        #[arg(short, long, default_value = ".")]
        destination: PathBuf,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Crawl checkbox ids from the portal
    Crawl {
        #[arg(value_enum)]
        page: CrawlPage,
        /// Output JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Map guessed study-data names to the names inside a downloaded archive
    BuildMapping {
        /// Zip of everything downloaded from the study-data page
        #[arg(long)]
        download_zip: PathBuf,
        /// Guessed name -> checkbox id table from `crawl study-data`
        #[arg(long)]
        guessed_filename: PathBuf,
        #[arg(short, long, default_value = "guessed_to_real.json")]
        output: PathBuf,
    },
    /// Find the NIfTI file of a subject, event and protocol in an extracted collection
    FindNifti {
        subject: String,
        /// Study-data event id, e.g. V06
        event: String,
        /// Protocol description, e.g. "MPRAGE GRAPPA"
        description: String,
        /// Directory the collection was extracted into
        #[arg(short, long, default_value = "PPMI")]
        directory: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Archived,
    Nifti,
}

impl From<FormatArg> for ImageFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Archived => ImageFormat::Archived,
            FormatArg::Nifti => ImageFormat::Nifti,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CrawlPage {
    StudyData,
    AdvancedSearch,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = logging::init(args.verbose);
    let logger = Logger::new("ppmi", level);

    if let Err(e) = run(args, &logger).await {
        logger.error(format_args!("{:#}", e));
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(args.settings.as_deref())?;

    if args.headed {
        settings.browser.headless = false;
    }
    if args.no_sandbox {
        settings.browser.no_sandbox = true;
    }
    if let Some(path) = &args.chrome_path {
        settings.browser.chrome_path = Some(path.clone());
    }
    if let Some(port) = args.debug_port {
        settings.browser.debug_port = Some(port);
    }

    Ok(settings)
}

fn load_catalog(path: &Path, logger: &Logger) -> anyhow::Result<CheckboxCatalog> {
    if path.exists() {
        return Ok(CheckboxCatalog::load(path)?);
    }
    logger.warn(format_args!(
        "{} not found, run `crawl study-data` first",
        path.display()
    ));
    Ok(CheckboxCatalog::default())
}

fn load_mapping(path: &Path, logger: &Logger) -> anyhow::Result<ChannelMapping> {
    if path.exists() {
        return Ok(ChannelMapping::load(path)?);
    }
    logger.debug(format_args!("{} not found, real file names unavailable", path.display()));
    Ok(ChannelMapping::default())
}

async fn run(args: Args, logger: &Logger) -> anyhow::Result<()> {
    if let Command::BuildMapping {
        download_zip,
        guessed_filename,
        output,
    } = &args.command
    {
        return build_mapping(download_zip, guessed_filename, output, logger);
    }
    if let Command::FindNifti {
        subject,
        event,
        description,
        directory,
    } = &args.command
    {
        return find_nifti(directory, subject, event, description, logger);
    }

    let settings = load_settings(&args)?;
    let credentials = load_credentials(&args.credentials)?;
    let catalog = load_catalog(&settings.mapping.checkbox_ids, logger)?;
    let mapping = load_mapping(&settings.mapping.guessed_to_real, logger)?;

    let mut session = Session::launch(&settings, credentials, catalog, mapping, logger.clone())
        .await
        .context("Could not start a browser session")?;

    let outcome = run_command(&mut session, &args.command, &settings, logger).await;
    let closed = session.close().await;
    outcome?;
    closed?;
    Ok(())
}

async fn run_command(
    session: &mut Session<ppmi_downloader::ChromeSurface>,
    command: &Command,
    settings: &Settings,
    logger: &Logger,
) -> anyhow::Result<()> {
    let seconds = |t: &Option<u64>| t.map(Duration::from_secs);

    match command {
        Command::Metadata {
            files,
            destination,
            timeout,
        } => {
            let routed = session
                .download_metadata(files, destination, seconds(timeout))
                .await?;
            logger.info(format_args!("{} file(s) saved to {}", routed.len(), destination.display()));
        }
        Command::Imaging {
            subjects,
            destination,
            format,
            timeout,
        } => {
            let routed = session
                .download_imaging_data(subjects, destination, (*format).into(), seconds(timeout))
                .await?;
            logger.info(format_args!("{} file(s) saved to {}", routed.len(), destination.display()));
        }
        Command::T1Info {
            destination,
            timeout,
        } => {
            let name = session
                .download_3d_t1_info(destination, seconds(timeout))
                .await?;
            println!("{}", destination.join(name).display());
        }
        Command::Crawl { page, output } => {
            let table = match page {
                CrawlPage::StudyData => {
                    let output = output
                        .clone()
                        .unwrap_or_else(|| settings.mapping.checkbox_ids.clone());
                    session.crawl_study_data(&output).await?
                }
                CrawlPage::AdvancedSearch => {
                    let output = output
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("search_to_checkbox_id.json"));
                    session.crawl_advanced_search(&output).await?
                }
            };
            logger.info(format_args!("Crawled {} checkbox(es)", table.len()));
        }
        Command::BuildMapping {
            download_zip,
            guessed_filename,
            output,
        } => build_mapping(download_zip, guessed_filename, output, logger)?,
        Command::FindNifti {
            subject,
            event,
            description,
            directory,
        } => find_nifti(directory, subject, event, description, logger)?,
    }

    Ok(())
}

fn build_mapping(
    download_zip: &Path,
    guessed_filename: &Path,
    output: &Path,
    logger: &Logger,
) -> anyhow::Result<()> {
    let real = archive_members(download_zip)
        .with_context(|| format!("Not a zip file {}", download_zip.display()))?;
    let guessed: Vec<String> = CheckboxCatalog::load(guessed_filename)?
        .names()
        .map(str::to_string)
        .collect();

    let reconciler = Reconciler::new(default_measures(), logger.child("reconcile"));
    let mapping = reconciler.find_matching(&real, &guessed)?;
    ppmi_downloader::mapping::write_table(output, &mapping)?;

    logger.info(format_args!(
        "Mapped {} guessed name(s) onto {} file(s), written to {}",
        mapping.len(),
        real.len(),
        output.display()
    ));
    Ok(())
}

fn find_nifti(
    directory: &Path,
    subject: &str,
    event: &str,
    description: &str,
    logger: &Logger,
) -> anyhow::Result<()> {
    let finder = NiftiFinder::new(directory, logger.child("finder"));
    match finder.find(subject, event, description)? {
        Some(path) => println!("{}", path.display()),
        None => anyhow::bail!(
            "No image of subject {} at {} with protocol '{}' under {}",
            subject,
            event,
            description,
            directory.display()
        ),
    }
    Ok(())
}
