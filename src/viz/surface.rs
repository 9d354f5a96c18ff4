//! Pointer input plumbing for canvases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Down,
    Move,
    Up,
    TouchStart,
    TouchMove,
    TouchEnd,
}

impl PointerKind {
    pub const ALL: [PointerKind; 6] = [
        PointerKind::Down,
        PointerKind::Move,
        PointerKind::Up,
        PointerKind::TouchStart,
        PointerKind::TouchMove,
        PointerKind::TouchEnd,
    ];

    pub fn is_press(self) -> bool {
        matches!(self, PointerKind::Down | PointerKind::TouchStart)
    }

    pub fn is_motion(self) -> bool {
        matches!(self, PointerKind::Move | PointerKind::TouchMove)
    }

    pub fn is_release(self) -> bool {
        matches!(self, PointerKind::Up | PointerKind::TouchEnd)
    }
}

/// Pointer position in client (page) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub client_x: f64,
    pub client_y: f64,
}

impl PointerEvent {
    pub fn new(kind: PointerKind, client_x: f64, client_y: f64) -> Self {
        Self {
            kind,
            client_x,
            client_y,
        }
    }
}

/// Client-space bounding rectangle of a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type PointerHandler = Box<dyn FnMut(&PointerEvent) + Send>;

/// Something pointer handlers can be attached to.
pub trait PointerSurface: Send + Sync {
    fn bounding_rect(&self) -> Rect;
    fn listen(&self, kind: PointerKind, handler: PointerHandler) -> ListenerId;
    /// Returns whether the listener was still attached.
    fn unlisten(&self, id: ListenerId) -> bool;
}

type Slot = (PointerKind, Arc<Mutex<PointerHandler>>);

/// In-process surface: events are injected with [`SoftSurface::emit`].
pub struct SoftSurface {
    rect: Mutex<Rect>,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, Slot>>,
}

impl std::fmt::Debug for SoftSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftSurface")
            .field("rect", &self.bounding_rect())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl SoftSurface {
    pub fn new(rect: Rect) -> Self {
        Self {
            rect: Mutex::new(rect),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// A surface at the origin with the given size.
    pub fn sized(width: f64, height: f64) -> Self {
        Self::new(Rect {
            left: 0.0,
            top: 0.0,
            width,
            height,
        })
    }

    pub fn set_rect(&self, rect: Rect) {
        *self.rect.lock().unwrap_or_else(PoisonError::into_inner) = rect;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `event` to its listeners in attach order. Returns how many ran.
    pub fn emit(&self, event: PointerEvent) -> usize {
        let mut targets: Vec<(ListenerId, Arc<Mutex<PointerHandler>>)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, (kind, _))| *kind == event.kind)
            .map(|(id, (_, h))| (*id, Arc::clone(h)))
            .collect();
        targets.sort_by_key(|(id, _)| *id);
        for (_, handler) in &targets {
            let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
            let call: &mut PointerHandler = &mut guard;
            call(&event);
        }
        targets.len()
    }
}

impl PointerSurface for SoftSurface {
    fn bounding_rect(&self) -> Rect {
        *self.rect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listen(&self, kind: PointerKind, handler: PointerHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (kind, Arc::new(Mutex::new(handler))));
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn only_matching_kinds_fire_and_unlisten_detaches() {
        let surface = SoftSurface::sized(100.0, 100.0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = surface.listen(
            PointerKind::Down,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(surface.emit(PointerEvent::new(PointerKind::Move, 1.0, 1.0)), 0);
        assert_eq!(surface.emit(PointerEvent::new(PointerKind::Down, 1.0, 1.0)), 1);
        assert!(surface.unlisten(id));
        assert!(!surface.unlisten(id));
        assert_eq!(surface.emit(PointerEvent::new(PointerKind::Down, 1.0, 1.0)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(surface.listener_count(), 0);
    }
}
