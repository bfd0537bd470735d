//! Local render sink
//!
//! Remote tracks are laid out on a grid surface owned by a dedicated render
//! thread. The thread never touches loop-owned state directly; it posts work
//! through a `DispatchBridge`, which is only populated while a
//! `DispatchRegistration` borrowed from the sink is alive.

use crate::config::RenderSettings;
use crate::event_loop::LoopHandle;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Work posted from the render thread onto the event loop
pub type LoopTask = Box<dyn FnOnce(&LoopHandle) + Send>;

type DispatchFn = Box<dyn Fn(LoopTask) -> bool + Send + Sync>;

/// Slot holding the loop's dispatch function while a registration exists
#[derive(Clone, Default)]
pub struct DispatchBridge {
    slot: Arc<Mutex<Option<DispatchFn>>>,
}

impl DispatchBridge {
    /// Post a task onto the loop. False when no loop is registered or the
    /// loop has stopped; the task is dropped.
    pub fn post(&self, task: LoopTask) -> bool {
        match self.slot.lock().as_ref() {
            Some(dispatch) => dispatch(task),
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn install(&self, dispatch: DispatchFn) {
        *self.slot.lock() = Some(dispatch);
    }

    fn clear(&self) {
        self.slot.lock().take();
    }
}

/// Clears the bridge on drop; borrows the sink so it cannot outlive it
pub struct DispatchRegistration<'a> {
    sink: &'a RenderSink,
}

impl Drop for DispatchRegistration<'_> {
    fn drop(&mut self) {
        self.sink.bridge.clear();
        debug!("Render dispatch bridge cleared");
    }
}

#[derive(Debug)]
enum RenderCommand {
    TrackAdded { id: String },
    TrackRemoved { id: String },
    Frame { id: String },
    Close,
    Shutdown,
}

/// Cloneable sender used by the media session manager
#[derive(Clone)]
pub struct RenderHandle {
    tx: Sender<RenderCommand>,
}

impl RenderHandle {
    pub fn track_added(&self, id: &str) {
        let _ = self.tx.send(RenderCommand::TrackAdded { id: id.to_string() });
    }

    pub fn track_removed(&self, id: &str) {
        let _ = self.tx.send(RenderCommand::TrackRemoved { id: id.to_string() });
    }

    pub fn frame(&self, id: &str) {
        let _ = self.tx.send(RenderCommand::Frame { id: id.to_string() });
    }
}

/// Placement of one track on the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Split the surface into a near-square grid with one cell per track
pub fn grid_layout(count: usize, width: u32, height: u32) -> Vec<Rect> {
    if count == 0 {
        return Vec::new();
    }
    let mut cols = 1usize;
    while cols * cols < count {
        cols += 1;
    }
    let rows = count.div_ceil(cols);
    let cell_w = width / cols as u32;
    let cell_h = height / rows as u32;

    (0..count)
        .map(|i| Rect {
            x: (i % cols) as u32 * cell_w,
            y: (i / cols) as u32 * cell_h,
            width: cell_w,
            height: cell_h,
        })
        .collect()
}

/// One remote track on the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackView {
    pub id: String,
    pub frames: u64,
    pub rect: Rect,
}

/// State owned by the render thread
#[derive(Debug, Default)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub tracks: Vec<TrackView>,
    pub close_posted: bool,
}

impl Surface {
    fn relayout(&mut self) {
        let rects = grid_layout(self.tracks.len(), self.width, self.height);
        for (track, rect) in self.tracks.iter_mut().zip(rects) {
            track.rect = rect;
        }
    }
}

pub struct RenderSink {
    tx: Sender<RenderCommand>,
    bridge: DispatchBridge,
    thread: Option<JoinHandle<Surface>>,
}

impl RenderSink {
    pub fn spawn(settings: RenderSettings) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let bridge = DispatchBridge::default();
        let thread_bridge = bridge.clone();

        let thread = std::thread::Builder::new()
            .name("render".to_string())
            .spawn(move || render_thread(settings, rx, thread_bridge))?;

        info!(
            "Render sink started: {}x{}{}",
            settings.width,
            settings.height,
            if settings.fullscreen { " fullscreen" } else { "" }
        );
        Ok(Self {
            tx,
            bridge,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RenderHandle {
        RenderHandle { tx: self.tx.clone() }
    }

    /// Install the loop's dispatch function for the lifetime of the
    /// returned registration
    pub fn register_dispatch(&self, lp: LoopHandle) -> DispatchRegistration<'_> {
        self.bridge
            .install(Box::new(move |task: LoopTask| lp.dispatch(task)));
        DispatchRegistration { sink: self }
    }

    pub fn bridge(&self) -> &DispatchBridge {
        &self.bridge
    }

    /// The window was closed by the user
    pub fn request_close(&self) {
        let _ = self.tx.send(RenderCommand::Close);
    }

    /// Stop the render thread and return its final surface
    pub fn finish(mut self) -> Option<Surface> {
        self.join()
    }

    fn join(&mut self) -> Option<Surface> {
        let thread = self.thread.take()?;
        let _ = self.tx.send(RenderCommand::Shutdown);
        match thread.join() {
            Ok(surface) => Some(surface),
            Err(_) => {
                warn!("Render thread panicked");
                None
            }
        }
    }
}

impl Drop for RenderSink {
    fn drop(&mut self) {
        self.bridge.clear();
        self.join();
    }
}

fn render_thread(settings: RenderSettings, rx: Receiver<RenderCommand>, bridge: DispatchBridge) -> Surface {
    let mut surface = Surface {
        width: settings.width,
        height: settings.height,
        fullscreen: settings.fullscreen,
        ..Default::default()
    };

    // Parked until the next command; every sender gone ends the thread.
    while let Ok(command) = rx.recv() {
        match command {
            RenderCommand::TrackAdded { id } => {
                if surface.tracks.iter().all(|t| t.id != id) {
                    surface.tracks.push(TrackView {
                        id: id.clone(),
                        frames: 0,
                        rect: Rect { x: 0, y: 0, width: 0, height: 0 },
                    });
                    surface.relayout();
                    let count = surface.tracks.len();
                    bridge.post(Box::new(move |_: &LoopHandle| {
                        info!("Rendering track {} ({} on screen)", id, count)
                    }));
                }
            }
            RenderCommand::TrackRemoved { id } => {
                surface.tracks.retain(|t| t.id != id);
                surface.relayout();
            }
            RenderCommand::Frame { id } => {
                if let Some(track) = surface.tracks.iter_mut().find(|t| t.id == id) {
                    track.frames += 1;
                }
            }
            RenderCommand::Close => {
                info!("Render window closed");
                surface.close_posted = bridge.post(Box::new(|lp: &LoopHandle| lp.stop()));
                if !surface.close_posted {
                    debug!("Loop not accepting work, close request dropped");
                }
            }
            RenderCommand::Shutdown => break,
        }
    }
    surface
}
