// =============================================================================
// MODEL VIEWER - A textured, mip-mapped model rendered with Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, redraw requests)              │
// │    └── FrameLoop (slot rotation, resize/recreate state)         │
// │          └── Renderer (swapchain, pipeline, buffers, texture)   │
// │                └── GraphicsContext (instance, device, memory)   │
// └─────────────────────────────────────────────────────────────────┘
//
// Assets are loaded before the window opens so a bad path fails fast.
// Any fatal error is logged and turns into a non-zero exit code.
//
// =============================================================================

mod backend;
mod config;
mod frame;
mod mesh;
mod renderer;
mod uniform;

use anyhow::{Context, Result};
use ash::vk;
use backend::{GraphicsContext, ENABLE_VALIDATION};
use config::Config;
use frame::{FrameLoop, FrameOutcome};
use renderer::{Assets, Renderer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, source) = Config::load();

    init_logging(&config)?;
    log::info!("Starting model viewer");
    source.report();
    log::debug!("Config: {:?}", config);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.resizable { "resizable" } else { "fixed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let assets = Assets::load(&config)
        .context("Failed to load assets")
        .inspect_err(|e| log::error!("{:#}", e))?;
    log::info!("Loaded assets for '{}'", assets.model.name);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, assets);
    event_loop.run_app(&mut app)?;

    app.finish()
}

/// Writes every log record to stderr and to the log file
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;

        writeln!(file, "=== Model Viewer Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;

        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder.try_init().context("Failed to initialize logger")?;
    Ok(())
}

// =============================================================================
// FPS TRACKING
// =============================================================================

#[derive(Debug)]
struct FpsCounter {
    frames: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count a presented frame. Once per second returns the average frame
    /// rate and the duration of the latest frame.
    fn tick(&mut self, now: Instant) -> Option<(f32, Duration)> {
        let frame_time = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frames as f32 / elapsed;
        self.frames = 0;
        self.last_update = now;
        Some((fps, frame_time))
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    /// Consumed when the renderer is created
    assets: Option<Assets>,
    renderer: Option<Renderer>,
    frame_loop: FrameLoop,
    fps: FpsCounter,
    /// First fatal error; reported after the event loop returns
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, assets: Assets) -> Self {
        Self {
            config,
            assets: Some(assets),
            renderer: None,
            frame_loop: FrameLoop::new(),
            fps: FpsCounter::new(Instant::now()),
            fatal: None,
        }
    }

    /// Create the window, the graphics context and every GPU resource
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(self.config.window.resizable);

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .context("Failed to create window")?,
        );

        let context = GraphicsContext::new(
            &self.config.window.title,
            ENABLE_VALIDATION,
            self.config.graphics.msaa,
            &window,
        )?;

        let assets = self.assets.take().context("Assets already consumed")?;
        self.renderer = Some(Renderer::new(context, window, &self.config, assets)?);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        if let Some((fps, frame_time)) = self.fps.tick(Instant::now()) {
            if let Some(renderer) = &self.renderer {
                renderer.window().set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time.as_secs_f32() * 1000.0
                ));
            }
        }
    }

    /// Exit status once the event loop has returned
    fn finish(mut self) -> Result<()> {
        // Tear down GPU resources before reporting
        self.renderer = None;

        match self.fatal.take() {
            Some(error) => Err(error),
            None => {
                log::info!("Clean shutdown");
                Ok(())
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() || self.fatal.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                let extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };

                // Restored from minimized: about_to_wait stopped asking
                if self.frame_loop.notify_resized(extent) {
                    if let Some(renderer) = &self.renderer {
                        renderer.window().request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };

                match self.frame_loop.draw_frame(renderer) {
                    Ok(FrameOutcome::Presented | FrameOutcome::PresentedAndRecreated) => {
                        self.update_fps();
                    }
                    Ok(FrameOutcome::Skipped) => {}
                    Err(e) => self.fail(event_loop, e.context("Render error")),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Keep drawing continuously. While the window has no drawable area
    /// nothing is requested, so the loop sleeps until the next resize.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.frame_loop.is_suspended() {
            return;
        }

        if let Some(renderer) = &self.renderer {
            renderer.window().request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("Cleaning up Vulkan resources...");
        // Waits for the device to go idle before anything is destroyed
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert!(fps.tick(start + Duration::from_millis(i * 16)).is_none());
        }

        let (rate, frame_time) = fps.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((rate - 60.0).abs() < 0.01);
        assert_eq!(frame_time, Duration::from_millis(56));

        // Counting restarts after a report
        assert!(fps.tick(start + Duration::from_millis(1016)).is_none());
    }
}
