mod app;
mod ui;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use app::App;
use clap::Parser;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::execute;
use gridmap::assign::{AssignmentStore, JsonFileAssignmentStore, ProximityAssigner};
use gridmap::config::Config;
use gridmap::data::{self, DatasetProvider, DemoDatasets, FileDatasets};
use gridmap::map::Basemap;
use gridmap::model::AssetCategory;
use gridmap::quota::{FileQuotaStore, QuotaGovernor, QuotaStore};
use gridmap::reconcile::MarkerReconciler;
use gridmap::session::{MapSession, SessionTimings};
use ratatui::DefaultTerminal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gridmap", version, about = "Grid asset map in the terminal")]
struct Cli {
    /// Config file (defaults to ./gridmap.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory with dataset and basemap files; overrides the config
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Use the built-in demo fleet instead of dataset files
    #[arg(long)]
    demo: bool,

    /// Where log output goes while the terminal UI is running
    #[arg(long, default_value = "gridmap.log")]
    log_file: PathBuf,
}

fn init_logging(path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create log file {}", path.display()))?;
    let filter = EnvFilter::try_from_env("GRIDMAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_file)?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    info!(data_dir = %config.data_dir.display(), "starting gridmap");

    let quota_store = FileQuotaStore::open(&config.quota.state_file)?;
    let assignment_store = JsonFileAssignmentStore::open(&config.assignment.store_file)?;

    let files = FileDatasets::new(&config.data_dir);
    let provider: Arc<dyn DatasetProvider> = if cli.demo || !files.has_any() {
        info!("no dataset files found, using demo fleet");
        Arc::new(DemoDatasets::new(config.session.options().center, 42))
    } else {
        Arc::new(files)
    };

    let mut basemap = Basemap::new();
    let lines = data::load_basemap(&mut basemap, &config.data_dir);
    if !basemap.has_data() {
        data::builtin_outline(&mut basemap);
    }
    info!(lines, "basemap ready");

    let mut terminal = ratatui::init();
    terminal.clear()?;
    execute!(std::io::stdout(), EnableMouseCapture)?;

    let size = terminal.size()?;
    let governor = QuotaGovernor::new(quota_store, config.quota.limits());
    let session = MapSession::new(
        governor,
        MarkerReconciler::new(config.markers.hide_below_zoom),
        config.session.options(),
        SessionTimings {
            init_delay: config.session.init_delay(),
            load_timeout: config.session.load_timeout(),
        },
    );
    let mut app = App::new(
        app::terminal_surface(basemap, size.width as usize, size.height as usize),
        session,
        ProximityAssigner::new(assignment_store, config.assignment.max_distance_miles),
        provider,
        config.filters.filters(),
        config.markers.fit_options(),
    );

    let result = run(&mut terminal, &mut app);

    let _ = execute!(std::io::stdout(), DisableMouseCapture);
    ratatui::restore();
    info!("exiting");

    result
}

/// Handle mouse events for panning, zooming and selection
fn handle_mouse<Q: QuotaStore, A: AssignmentStore>(app: &mut App<Q, A>, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollUp => app.zoom_in_at(mouse.column, mouse.row),
        MouseEventKind::ScrollDown => app.zoom_out_at(mouse.column, mouse.row),
        // trackpad two-finger swipe
        MouseEventKind::ScrollLeft => app.pan(-15, 0),
        MouseEventKind::ScrollRight => app.pan(15, 0),
        MouseEventKind::Down(MouseButton::Left) => app.press(mouse.column, mouse.row),
        MouseEventKind::Drag(MouseButton::Left) => app.handle_drag(mouse.column, mouse.row),
        MouseEventKind::Up(MouseButton::Left) => app.release(mouse.column, mouse.row),
        _ => {}
    }
}

fn handle_key<Q: QuotaStore, A: AssignmentStore>(app: &mut App<Q, A>, code: KeyCode) {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => app.quit(),

        KeyCode::Left | KeyCode::Char('h') => app.pan(-10, 0),
        KeyCode::Right | KeyCode::Char('l') => app.pan(10, 0),
        KeyCode::Up | KeyCode::Char('k') => app.pan(0, -6),
        KeyCode::Down | KeyCode::Char('j') => app.pan(0, 6),

        KeyCode::Char('+') | KeyCode::Char('=') => app.zoom_in(),
        KeyCode::Char('-') | KeyCode::Char('_') => app.zoom_out(),

        KeyCode::Char(c @ '1'..='9') => {
            let idx = c as usize - '1' as usize;
            if let Some(category) = AssetCategory::ALL.get(idx) {
                app.toggle_category(*category);
            }
        }
        KeyCode::Char('[') => app.adjust_risk(0.0, -0.1),
        KeyCode::Char(']') => app.adjust_risk(0.0, 0.1),
        KeyCode::Char('{') => app.adjust_risk(-0.1, 0.0),
        KeyCode::Char('}') => app.adjust_risk(0.1, 0.0),
        KeyCode::Char(',') => app.shift_years(-1, 0),
        KeyCode::Char('.') => app.shift_years(1, 0),
        KeyCode::Char('<') => app.shift_years(0, -1),
        KeyCode::Char('>') => app.shift_years(0, 1),
        KeyCode::Char('0') => app.reset_filters(),

        KeyCode::Char('b') | KeyCode::Char('B') => app.surface.basemap.toggle_borders(),
        KeyCode::Char('f') => app.fit_to_data(),
        KeyCode::Char('r') => app.reinit(Instant::now()),
        KeyCode::Char('R') => app.recompute_assignments(),
        KeyCode::Char('u') => app.refresh_data(),
        _ => {}
    }
}

fn run<Q: QuotaStore, A: AssignmentStore>(terminal: &mut DefaultTerminal, app: &mut App<Q, A>) -> Result<()> {
    app.start(Instant::now());

    loop {
        terminal.draw(|frame| ui::render(frame, &*app))?;
        app.frame_drawn();

        // ~60fps
        if event::poll(Duration::from_millis(16))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(app, key.code),
                Event::Mouse(mouse) => handle_mouse(app, mouse),
                Event::Resize(width, height) => app.resize(width as usize, height as usize),
                _ => {}
            }
        }

        app.tick(Instant::now());

        if app.should_quit {
            break;
        }
    }

    Ok(())
}
