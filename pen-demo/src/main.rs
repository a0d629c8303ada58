use std::{
    fs::{self, File},
    sync::Arc,
};

use clap::Parser;
use pen_renderer::{
    ClearState, PhysicalDeviceSelection, PrimitiveTopology, Renderer, RendererConfig,
    ResourceHandle, SwapchainConfig, ValidationLevel, vk,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};

const CLEAR_SLOT: ResourceHandle = ResourceHandle(0);
const BACKBUFFER_SLOT: ResourceHandle = ResourceHandle(1);
const CLEAR_COLOUR: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //Off never installs a subscriber
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliValidationLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliValidationLevel> for ValidationLevel {
    fn from(value: CliValidationLevel) -> Self {
        match value {
            CliValidationLevel::Verbose => ValidationLevel::Verbose,
            CliValidationLevel::Info => ValidationLevel::Info,
            CliValidationLevel::Warning => ValidationLevel::Warning,
            CliValidationLevel::Error => ValidationLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliPresentMode {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl From<CliPresentMode> for vk::PresentModeKHR {
    fn from(value: CliPresentMode) -> Self {
        match value {
            CliPresentMode::Fifo => vk::PresentModeKHR::FIFO,
            CliPresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            CliPresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    /// Forward validation layer messages at or above this severity.
    #[arg(short, long)]
    graphics_debug_level: Option<CliValidationLevel>,
    /// Use the physical device at this enumeration index.
    #[arg(long, conflicts_with = "prefer_discrete")]
    device_index: Option<usize>,
    #[arg(long)]
    prefer_discrete: bool,
    #[arg(long, default_value = "fifo")]
    present_mode: CliPresentMode,
    /// Exit after presenting this many frames.
    #[arg(long)]
    frames: Option<u64>,
}

impl CliArgs {
    fn renderer_config(&self) -> RendererConfig {
        let physical_device = match (self.device_index, self.prefer_discrete) {
            (Some(index), _) => PhysicalDeviceSelection::Index(index),
            (None, true) => PhysicalDeviceSelection::PreferDiscrete,
            (None, false) => PhysicalDeviceSelection::First,
        };
        RendererConfig {
            app_name: "pen-demo".to_owned(),
            validation: self.graphics_debug_level.map(Into::into),
            physical_device,
            swapchain: SwapchainConfig {
                present_mode: self.present_mode.into(),
                ..SwapchainConfig::default()
            },
            ..RendererConfig::default()
        }
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "pen", "pen-demo");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        config: cli_args.renderer_config(),
        frame_limit: cli_args.frames,
        win: None,
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Exiting,
}

/// Waiting for a window. After a suspend the old window is kept and the
/// renderer is rebuilt on it.
#[derive(Debug)]
struct InitializingState {
    config: RendererConfig,
    frame_limit: Option<u64>,
    win: Option<Arc<WinitWindow>>,
}

#[derive(Debug)]
struct RunningState {
    config: RendererConfig,
    frame_limit: Option<u64>,
    win: Arc<WinitWindow>,
    renderer: Renderer<WinitWindow>,
    frames_presented: u64,
}

impl RunningState {
    fn start(
        initializing: InitializingState,
        event_loop: &ActiveEventLoop,
    ) -> eyre::Result<Self> {
        let win = match initializing.win {
            Some(win) => win,
            None => Arc::new(event_loop.create_window(
                WindowAttributes::default()
                    .with_title("pen-demo")
                    .with_inner_size(LogicalSize {
                        width: 800,
                        height: 600,
                    }),
            )?),
        };
        let size = win.inner_size();
        let mut renderer = Renderer::initialise(
            Arc::clone(&win),
            (size.width, size.height),
            BACKBUFFER_SLOT,
            None,
            initializing.config.clone(),
        )?;
        renderer.create_clear_state(CLEAR_SLOT, &ClearState::colour(CLEAR_COLOUR))?;
        tracing::info!("Renderer ready:\n{}", renderer.get_info());

        Ok(Self {
            config: initializing.config,
            frame_limit: initializing.frame_limit,
            win,
            renderer,
            frames_presented: 0,
        })
    }

    fn render_frame(&mut self) -> eyre::Result<()> {
        self.renderer.clear(CLEAR_SLOT, None, None)?;
        self.renderer.set_targets(&[BACKBUFFER_SLOT], None, 0, 0)?;
        self.renderer.draw(3, 0, PrimitiveTopology::TriangleList)?;
        self.renderer.present()?;
        self.frames_presented += 1;
        Ok(())
    }

    fn frame_limit_reached(&self) -> bool {
        self.frame_limit
            .is_some_and(|limit| self.frames_presented >= limit)
    }
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        let Some(initializing_state) = self.take_initializing() else {
            return;
        };
        event_loop.set_control_flow(ControlFlow::Poll);
        match RunningState::start(initializing_state, event_loop) {
            Ok(running) => {
                tracing::debug!("State transition: Initializing -> Running");
                running.win.request_redraw();
                self.0 = Some(App::Running(running));
            }
            Err(e) => {
                tracing::error!("Error while starting the renderer: {}", e);
                self.transition_to_exiting("Initializing", event_loop);
            }
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        let Some(running_state) = self.take_running() else {
            return;
        };
        event_loop.set_control_flow(ControlFlow::Wait);
        let RunningState {
            config,
            frame_limit,
            win,
            renderer,
            frames_presented: _,
        } = running_state;
        if let Err(e) = renderer.shutdown() {
            tracing::error!("Error while shutting down the renderer on suspend: {}", e);
            self.transition_to_exiting("Running", event_loop);
            return;
        }
        tracing::debug!("State transition: Running -> Initializing");
        self.0 = Some(App::Initializing(InitializingState {
            config,
            frame_limit,
            win: Some(win),
        }));
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        window_event: WindowEvent,
    ) {
        assert!(self.0.is_some());
        let Some(App::Running(running_state)) = self.0.as_mut() else {
            return;
        };
        if window_id != running_state.win.id() {
            return;
        }

        let keep_running = match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                false
            }
            WindowEvent::Resized(size) => {
                match running_state.renderer.resize(size.width, size.height) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!("Error while resizing: {}", e);
                        false
                    }
                }
            }
            WindowEvent::RedrawRequested => match running_state.render_frame() {
                Ok(()) if running_state.frame_limit_reached() => {
                    tracing::info!(
                        "Presented {} frames, exiting",
                        running_state.frames_presented
                    );
                    false
                }
                Ok(()) => {
                    running_state.win.request_redraw();
                    true
                }
                Err(e) => {
                    tracing::error!("Error while rendering a frame: {}", e);
                    false
                }
            },
            _ => true,
        };

        if !keep_running {
            self.exit_from_running(event_loop);
        }
    }
}

impl AppRunner {
    fn transition_to_exiting(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.0 = Some(App::Exiting);
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop) {
        match self.take_running() {
            Some(running_state) => {
                if let Err(e) = running_state.renderer.shutdown() {
                    tracing::error!("Error while shutting down the renderer: {}", e);
                }
                self.transition_to_exiting("Running", event_loop);
            }
            None => {
                tracing::warn!(
                    "Requested Running -> Exiting transition while not in Running state"
                );
                event_loop.exit();
            }
        }
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        match self.0.take() {
            Some(App::Initializing(s)) => Some(s),
            other => {
                self.0 = other;
                None
            }
        }
    }

    fn take_running(&mut self) -> Option<RunningState> {
        match self.0.take() {
            Some(App::Running(s)) => Some(s),
            other => {
                self.0 = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_selection_from_flags() {
        let args = CliArgs::parse_from(["pen-demo", "--device-index", "2"]);
        assert_eq!(
            args.renderer_config().physical_device,
            PhysicalDeviceSelection::Index(2)
        );
        let args = CliArgs::parse_from(["pen-demo", "--prefer-discrete"]);
        assert_eq!(
            args.renderer_config().physical_device,
            PhysicalDeviceSelection::PreferDiscrete
        );
        let args = CliArgs::parse_from(["pen-demo"]);
        assert_eq!(
            args.renderer_config().physical_device,
            PhysicalDeviceSelection::First
        );
    }

    #[test]
    fn present_mode_and_validation_reach_the_config() {
        let args = CliArgs::parse_from([
            "pen-demo",
            "--present-mode",
            "mailbox",
            "--graphics-debug-level",
            "warning",
        ]);
        let config = args.renderer_config();
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.validation, Some(ValidationLevel::Warning));
        assert_eq!(config.swapchain.min_image_count, 3);
    }

    #[test]
    fn index_and_discrete_conflict() {
        assert!(
            CliArgs::try_parse_from(["pen-demo", "--device-index", "0", "--prefer-discrete"])
                .is_err()
        );
    }
}
