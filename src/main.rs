use std::{ffi::CStr, rc::Rc};

use anyhow::Result;
use ash::{ext::debug_utils, vk::DebugUtilsMessengerEXT, Entry};
use raytracer::{
    get_debug_messenger_create_info, init_logging, CandidateDevice, DeviceSelector, Instance,
    Surface,
};
use tracing::{info, warn};
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    raw_window_handle::HasDisplayHandle,
    window::{Window, WindowBuilder, WindowButtons},
};

const WINDOW_WIDTH: u32 = 1280;
const WINDOW_HEIGHT: u32 = 720;
const WINDOW_TITLE: &str = "Raytracer";

#[cfg(feature = "enable_validations")]
const ENABLE_VALIDATIONS: bool = true;
#[cfg(not(feature = "enable_validations"))]
const ENABLE_VALIDATIONS: bool = false;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(&event_loop)?;
    app.run(event_loop)?;

    Ok(())
}

struct App {
    /// Candidate GPUs visible to the instance, ranked best first.
    // TODO: create the logical device and queue handles from the top ranked candidate
    _candidates: Vec<CandidateDevice>,
    /// The debug utils extension, if enabled
    debug_utils: Option<DebugUtilsExt>,
    /// See surface struct docs
    _surface: Surface,
    /// The instance for interacting with Vulkan core
    _instance: Rc<Instance>,
    /// The actual window presented to the user. Need to keep a reference to
    /// this for the life of the app or it will get cleaned up
    _window: Window,
}

impl App {
    pub fn new(event_loop: &EventLoop<()>) -> Result<Self> {
        let required_extensions =
            ash_window::enumerate_required_extensions(event_loop.display_handle()?.as_raw())?
                .into_iter()
                .map(|extension| unsafe { CStr::from_ptr(*extension) }.to_str())
                .collect::<Result<Vec<_>, _>>()?;

        let window = Self::init_window(event_loop)?;

        // init vulkan
        let entry = Entry::linked();
        let instance = Rc::new(Instance::new(entry, required_extensions)?);
        let debug_utils = Self::setup_debug_messenger(&instance)?;
        let surface = Surface::new(&instance, &window)?;

        let candidates = DeviceSelector::new(&instance, &surface).enumerate()?;
        Self::report_candidates(&candidates);

        Ok(Self {
            _candidates: candidates,
            debug_utils,
            _surface: surface,
            _instance: instance,
            _window: window,
        })
    }

    pub fn run(&mut self, event_loop: EventLoop<()>) -> Result<()> {
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop.run(move |event, elwp| match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                window_id: _,
            } => {
                elwp.exit();
            }
            _ => {}
        })?;
        Ok(())
    }

    /// Logs the ranked GPUs and which one would be used for rendering. A top
    /// candidate that scored 0 or lacks the needed queue families means no
    /// device on this machine can render and present.
    fn report_candidates(candidates: &[CandidateDevice]) {
        info!("Found {} candidate GPU(s)", candidates.len());
        for candidate in candidates {
            info!(
                "  {} ({:?}): score {}",
                candidate.name, candidate.device_type, candidate.score
            );
        }

        match candidates
            .first()
            .filter(|best| best.score > 0 && best.is_complete())
        {
            Some(best) => info!("Selected GPU: {}", best.name),
            None => warn!("No GPU is able to both render and present to the window surface"),
        }
    }

    /// Creates the window that will interact with the OS to draw the results on the screen
    fn init_window(event_loop: &EventLoop<()>) -> Result<Window> {
        let window = WindowBuilder::new()
            .with_inner_size(PhysicalSize::<u32>::from((WINDOW_WIDTH, WINDOW_HEIGHT)))
            .with_resizable(false)
            .with_enabled_buttons(WindowButtons::CLOSE)
            .with_active(true)
            .with_title(WINDOW_TITLE)
            .build(event_loop)?;
        Ok(window)
    }

    /// If validations are enabled, creates and registers the DebugUtils extension which prints
    /// logs to the console.
    fn setup_debug_messenger(instance: &Instance) -> Result<Option<DebugUtilsExt>> {
        if ENABLE_VALIDATIONS {
            let debug_utils_messenger_create_info = get_debug_messenger_create_info();
            let debug_utils = debug_utils::Instance::new(instance.get_entry(), instance);
            let extension = unsafe {
                debug_utils
                    .create_debug_utils_messenger(&debug_utils_messenger_create_info, None)?
            };
            return Ok(Some(DebugUtilsExt {
                debug_utils,
                extension,
            }));
        }
        Ok(None)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        info!("Window closed, shutting down");

        if let Some(debug_utils) = &self.debug_utils {
            unsafe {
                debug_utils
                    .debug_utils
                    .destroy_debug_utils_messenger(debug_utils.extension, None)
            };
        }
    }
}

/// Struct for holding the needed references for the DebugUtils extension.
/// Primarily used so that we can correctly clean it up at application
/// exit.
struct DebugUtilsExt {
    debug_utils: debug_utils::Instance,
    extension: DebugUtilsMessengerEXT,
}
