use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facewatch_core::{DetectedFace, RecognitionOptions, RecognitionResult, Size};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod overlay;

use overlay::Analysis;

/// Poll period for `live watch`, matching the daemon's analysis tick.
const WATCH_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Parser)]
#[command(name = "facewatch", about = "Face recognition front end CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage known people
    People {
        #[command(subcommand)]
        command: PeopleCommand,
    },
    /// Show or change recognition options
    Options {
        /// Report gender for each face
        #[arg(long)]
        gender: Option<Toggle>,
        /// Report the number of people in view
        #[arg(long)]
        count: Option<Toggle>,
    },
    /// Analyze a photo
    Analyze {
        photo: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Analyze one frame of a Motion-JPEG video
    AnalyzeVideo {
        file: PathBuf,
        /// Zero-based frame index
        #[arg(long, default_value_t = 0)]
        frame: u32,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Analyze many photos
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
    /// Start or stop the camera
    Camera {
        #[command(subcommand)]
        command: SwitchCommand,
    },
    /// Continuous analysis of the camera stream
    Live {
        #[command(subcommand)]
        command: LiveCommand,
    },
    /// Record the camera stream to a file
    Record {
        #[command(subcommand)]
        command: SwitchCommand,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum PeopleCommand {
    /// List known people
    List,
    /// Register a person from a reference photo
    Add { name: String, photo: PathBuf },
    /// Remove a person by id
    Remove { id: String },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Queue photos
    Add {
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Process pending and failed items
    Run {
        /// Wait for the run to finish
        #[arg(long)]
        wait: bool,
    },
    /// List queued items
    List,
    /// Show one item's result
    Show {
        id: String,
        #[arg(long, value_parser = overlay::parse_display)]
        display: Option<(u32, u32)>,
    },
    /// Remove all items
    Clear,
}

#[derive(Subcommand)]
enum SwitchCommand {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum LiveCommand {
    Start,
    Stop,
    /// Print live results as they arrive
    Watch {
        #[arg(long, value_parser = overlay::parse_display)]
        display: Option<(u32, u32)>,
    },
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Display box (WIDTHxHEIGHT) to fit the media into
    #[arg(long, value_parser = overlay::parse_display)]
    display: Option<(u32, u32)>,
    /// Write an annotated PNG
    #[arg(long)]
    annotate: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[zbus::proxy(
    interface = "org.facewatch.FaceWatch1",
    default_service = "org.facewatch.FaceWatch1",
    default_path = "/org/facewatch/FaceWatch1"
)]
trait FaceWatch {
    async fn list_people(&self) -> zbus::Result<String>;
    async fn add_person(&self, name: &str, photo_path: &str) -> zbus::Result<String>;
    async fn remove_person(&self, id: &str) -> zbus::Result<bool>;
    async fn get_options(&self) -> zbus::Result<String>;
    async fn set_options(&self, recognize_gender: bool, count_people: bool) -> zbus::Result<String>;
    async fn analyze_image(&self, path: &str) -> zbus::Result<String>;
    async fn analyze_video_frame(&self, path: &str, index: u32) -> zbus::Result<String>;
    async fn batch_add(&self, paths: Vec<String>) -> zbus::Result<String>;
    async fn batch_run(&self) -> zbus::Result<u32>;
    async fn batch_list(&self) -> zbus::Result<String>;
    async fn batch_select(&self, id: &str) -> zbus::Result<String>;
    async fn batch_clear(&self) -> zbus::Result<()>;
    async fn start_camera(&self) -> zbus::Result<String>;
    async fn stop_camera(&self) -> zbus::Result<String>;
    async fn start_analysis(&self) -> zbus::Result<bool>;
    async fn stop_analysis(&self) -> zbus::Result<bool>;
    async fn live_result(&self) -> zbus::Result<String>;
    async fn start_recording(&self) -> zbus::Result<String>;
    async fn stop_recording(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Deserialize)]
struct PersonEntry {
    id: String,
    name: String,
    created_at: String,
}

#[derive(Deserialize)]
struct BatchEntry {
    id: String,
    label: String,
    status: String,
    result: Option<RecognitionResult>,
    intrinsic_size: Size,
    error: Option<String>,
}

#[derive(Deserialize)]
struct BatchListing {
    running: bool,
    selected: Option<String>,
    items: Vec<BatchEntry>,
}

#[derive(Deserialize)]
struct LiveEntry {
    state: String,
    faces: Vec<DetectedFace>,
    person_count: u32,
    frame_size: Option<Size>,
    error: Option<String>,
    updated_at: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = FaceWatchProxy::new(&conn)
        .await
        .context("facewatchd is not reachable")?;
    tracing::debug!(destination = %proxy.inner().destination(), "connected to facewatchd");

    match cli.command {
        Commands::People { command } => people(&proxy, command).await?,
        Commands::Options { gender, count } => {
            let mut options = current_options(&proxy).await?;
            if gender.is_some() || count.is_some() {
                if let Some(gender) = gender {
                    options.recognize_gender = gender.enabled();
                }
                if let Some(count) = count {
                    options.count_people = count.enabled();
                }
                let json = proxy
                    .set_options(options.recognize_gender, options.count_people)
                    .await?;
                options = serde_json::from_str(&json)?;
            }
            println!("gender: {}", on_off(options.recognize_gender));
            println!("count:  {}", on_off(options.count_people));
        }
        Commands::Analyze { photo, render } => {
            let photo = absolute(&photo)?;
            let json = proxy.analyze_image(&path_arg(&photo)?).await?;
            let analysis: Analysis = serde_json::from_str(&json)?;
            let options = current_options(&proxy).await?;
            report(&analysis, render.display, options);
            if let Some(out) = render.annotate {
                let media = image::open(&photo)
                    .with_context(|| format!("failed to read {}", photo.display()))?
                    .to_rgb8();
                write_annotated(&media, &analysis, &render.display, options, &out)?;
            }
        }
        Commands::AnalyzeVideo { file, frame, render } => {
            let file = absolute(&file)?;
            let json = proxy.analyze_video_frame(&path_arg(&file)?, frame).await?;
            let analysis: Analysis = serde_json::from_str(&json)?;
            let options = current_options(&proxy).await?;
            report(&analysis, render.display, options);
            if let Some(out) = render.annotate {
                let still = facewatch_media::load_video_frame(&file, frame as usize)?;
                let media = image::load_from_memory(&still.jpeg)?.to_rgb8();
                write_annotated(&media, &analysis, &render.display, options, &out)?;
            }
        }
        Commands::Batch { command } => batch(&proxy, command).await?,
        Commands::Camera { command } => match command {
            SwitchCommand::Start => {
                let json = proxy.start_camera().await?;
                let info: serde_json::Value = serde_json::from_str(&json)?;
                println!(
                    "Camera {} streaming at {}x{}",
                    info["device"].as_str().unwrap_or("?"),
                    info["width"],
                    info["height"]
                );
            }
            SwitchCommand::Stop => {
                let saved = proxy.stop_camera().await?;
                println!("Camera stopped");
                if !saved.is_empty() {
                    println!("Recording saved to {saved}");
                }
            }
        },
        Commands::Live { command } => match command {
            LiveCommand::Start => {
                if proxy.start_analysis().await? {
                    println!("Live analysis started");
                } else {
                    println!("Live analysis already running");
                }
            }
            LiveCommand::Stop => {
                if proxy.stop_analysis().await? {
                    println!("Live analysis stopped");
                } else {
                    println!("Live analysis was not running");
                }
            }
            LiveCommand::Watch { display } => watch(&proxy, display).await?,
        },
        Commands::Record { command } => match command {
            SwitchCommand::Start => {
                let mime = proxy.start_recording().await?;
                println!("Recording ({mime})");
            }
            SwitchCommand::Stop => {
                let saved = proxy.stop_recording().await?;
                if saved.is_empty() {
                    println!("Not recording");
                } else {
                    println!("Recording saved to {saved}");
                }
            }
        },
        Commands::Status => {
            let json = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn people(proxy: &FaceWatchProxy<'_>, command: PeopleCommand) -> Result<()> {
    match command {
        PeopleCommand::List => {
            let people: Vec<PersonEntry> = serde_json::from_str(&proxy.list_people().await?)?;
            if people.is_empty() {
                println!("No people registered");
            }
            for person in people {
                println!("{}  {:<24} added {}", person.id, person.name, person.created_at);
            }
        }
        PeopleCommand::Add { name, photo } => {
            let photo = absolute(&photo)?;
            let json = proxy.add_person(&name, &path_arg(&photo)?).await?;
            let person: PersonEntry = serde_json::from_str(&json)?;
            println!("Added {} ({})", person.name, person.id);
        }
        PeopleCommand::Remove { id } => {
            if proxy.remove_person(&id).await? {
                println!("Removed {id}");
            } else {
                bail!("no person with id {id}");
            }
        }
    }
    Ok(())
}

async fn batch(proxy: &FaceWatchProxy<'_>, command: BatchCommand) -> Result<()> {
    match command {
        BatchCommand::Add { photos } => {
            let paths = photos
                .iter()
                .map(|p| absolute(p).and_then(|p| path_arg(&p)))
                .collect::<Result<Vec<_>>>()?;
            let ids: Vec<String> = serde_json::from_str(&proxy.batch_add(paths).await?)?;
            println!("Queued {} item(s)", ids.len());
        }
        BatchCommand::Run { wait } => {
            let submitted = proxy.batch_run().await?;
            println!("Submitted {submitted} item(s)");
            if wait && submitted > 0 {
                loop {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let listing: BatchListing = serde_json::from_str(&proxy.batch_list().await?)?;
                    if !listing.running {
                        print_batch(&listing);
                        break;
                    }
                }
            }
        }
        BatchCommand::List => {
            let listing: BatchListing = serde_json::from_str(&proxy.batch_list().await?)?;
            print_batch(&listing);
        }
        BatchCommand::Show { id, display } => {
            let entry: BatchEntry = serde_json::from_str(&proxy.batch_select(&id).await?)?;
            println!("{} [{}] {}", entry.label, entry.status, entry.id);
            if let Some(error) = &entry.error {
                println!("  error: {error}");
            }
            if let Some(result) = entry.result {
                let options = current_options(proxy).await?;
                let analysis = Analysis {
                    size: entry.intrinsic_size,
                    result,
                };
                report(&analysis, display, options);
            }
        }
        BatchCommand::Clear => {
            proxy.batch_clear().await?;
            println!("Batch cleared");
        }
    }
    Ok(())
}

fn print_batch(listing: &BatchListing) {
    if listing.items.is_empty() {
        println!("Batch is empty");
        return;
    }
    for item in &listing.items {
        let marker = if listing.selected.as_deref() == Some(item.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let faces = item
            .result
            .as_ref()
            .map(|r| format!("{} face(s)", r.faces.len()))
            .unwrap_or_default();
        println!("{marker} {}  {:<10} {:<24} {faces}", item.id, item.status, item.label);
    }
    if listing.running {
        println!("(running)");
    }
}

async fn watch(proxy: &FaceWatchProxy<'_>, display: Option<(u32, u32)>) -> Result<()> {
    let mut last_update: Option<String> = None;
    let mut ticks = tokio::time::interval(WATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticks.tick() => {}
        }
        let live: LiveEntry = serde_json::from_str(&proxy.live_result().await?)?;
        tracing::trace!(state = %live.state, faces = live.faces.len(), "live poll");
        if live.state == "Idle" {
            println!("Live analysis is not running");
            return Ok(());
        }
        if live.updated_at == last_update {
            continue;
        }
        last_update = live.updated_at.clone();

        if let Some(error) = &live.error {
            println!("error: {error}");
            continue;
        }
        let Some(size) = live.frame_size else {
            continue;
        };
        let options = current_options(proxy).await?;
        let analysis = Analysis {
            size,
            result: RecognitionResult {
                faces: live.faces,
                person_count: live.person_count,
            },
        };
        println!("--- {}", live.updated_at.as_deref().unwrap_or(""));
        report(&analysis, display, options);
    }
}

async fn current_options(proxy: &FaceWatchProxy<'_>) -> Result<RecognitionOptions> {
    Ok(serde_json::from_str(&proxy.get_options().await?)?)
}

fn report(analysis: &Analysis, display: Option<(u32, u32)>, options: RecognitionOptions) {
    let lines = overlay::describe(analysis, display, options.recognize_gender);
    if lines.is_empty() {
        println!("No faces detected");
    }
    for line in lines {
        println!("{line}");
    }
    if options.count_people {
        println!("People in view: {}", analysis.result.person_count);
    }
}

fn write_annotated(
    media: &image::RgbImage,
    analysis: &Analysis,
    display: &Option<(u32, u32)>,
    options: RecognitionOptions,
    out: &Path,
) -> Result<()> {
    let annotated = overlay::annotate(media, &analysis.result, *display, options.recognize_gender);
    annotated
        .save_with_format(out, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("Annotated image written to {}", out.display());
    Ok(())
}

/// The daemon resolves paths itself, so relative paths must be made absolute.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("cannot access {}", path.display()))
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}
