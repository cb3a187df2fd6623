//! Context-menu gesture, selection options and the "add note" flow.

use anyhow::Result;
use tracing::{debug, warn};

use crate::geometry::Point;
use crate::store::ViewerStore;
use crate::text_layer::TextLayer;
use crate::{Annotation, ContextInfo};

/// Host clipboard.
pub trait Clipboard {
    fn set_text(&mut self, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Copy,
    AddNote,
    AskAi,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub left: f64,
    pub top: f64,
    /// Opened to the left of the pointer because it would overflow.
    pub flipped: bool,
}

/// Places a panel of `width` beside `anchor`, flipping to the left side when
/// it would cross `viewport_right`.
pub fn place_beside(anchor: Point, width: f64, viewport_right: f64) -> Placement {
    if anchor.x + width > viewport_right {
        Placement {
            left: anchor.x - width,
            top: anchor.y,
            flipped: true,
        }
    } else {
        Placement {
            left: anchor.x,
            top: anchor.y,
            flipped: false,
        }
    }
}

/// Transient, user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Copied,
    NothingToCopy,
    CopyFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MenuOutcome {
    Notice(Notice),
    NoteInputOpened(Placement),
    /// Selection handed to the host's assistant integration.
    AskAi { text: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureResult {
    /// Default platform menu suppressed.
    Handled,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
enum MenuState {
    Closed,
    Menu {
        info: ContextInfo,
        placement: Placement,
    },
    NoteInput {
        info: ContextInfo,
        placement: Placement,
        draft: String,
    },
}

#[derive(Debug)]
pub struct ContextMenuController {
    page: usize,
    menu_width: f64,
    input_width: f64,
    viewport_right: f64,
    state: MenuState,
}

impl ContextMenuController {
    pub fn new(page: usize, menu_width: f64, input_width: f64) -> Self {
        Self {
            page,
            menu_width,
            input_width,
            viewport_right: f64::INFINITY,
            state: MenuState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, MenuState::Closed)
    }

    pub fn info(&self) -> Option<&ContextInfo> {
        match &self.state {
            MenuState::Closed => None,
            MenuState::Menu { info, .. } | MenuState::NoteInput { info, .. } => Some(info),
        }
    }

    pub fn placement(&self) -> Option<Placement> {
        match &self.state {
            MenuState::Closed => None,
            MenuState::Menu { placement, .. } | MenuState::NoteInput { placement, .. } => {
                Some(*placement)
            }
        }
    }

    pub fn is_editing_note(&self) -> bool {
        matches!(self.state, MenuState::NoteInput { .. })
    }

    /// `client` is the pointer in client coordinates, `selection` the
    /// platform's current text selection.
    pub fn on_context_menu(
        &mut self,
        client: Point,
        selection: Option<&str>,
        layer: &TextLayer,
        viewport_right: f64,
    ) -> GestureResult {
        let Some(viewport) = layer.viewport() else {
            return GestureResult::Ignored;
        };
        if !layer.client_bounds().contains(client) {
            return GestureResult::Ignored;
        }

        let local = layer.to_local(client);
        let info = ContextInfo {
            text: selection.map(str::to_owned),
            pdf_coord: viewport.point_to_document(local),
            screen_coord: local,
        };
        debug!(page = self.page, ?info, "context menu opened");

        self.viewport_right = viewport_right;
        self.state = MenuState::Menu {
            placement: place_beside(client, self.menu_width, viewport_right),
            info,
        };
        GestureResult::Handled
    }

    pub fn choose(&mut self, action: MenuAction, clipboard: &mut dyn Clipboard) -> MenuOutcome {
        let MenuState::Menu { info, placement } = &self.state else {
            return MenuOutcome::Closed;
        };
        match action {
            MenuAction::Copy => {
                let notice = match info.text.as_deref().filter(|t| !t.is_empty()) {
                    None => Notice::NothingToCopy,
                    Some(text) => match clipboard.set_text(text) {
                        Ok(()) => Notice::Copied,
                        Err(err) => {
                            warn!(page = self.page, error = ?err, "clipboard write failed");
                            Notice::CopyFailed(err.to_string())
                        }
                    },
                };
                self.state = MenuState::Closed;
                MenuOutcome::Notice(notice)
            }
            MenuAction::AddNote => {
                let anchor = Point::new(placement.left, placement.top);
                let anchor = if placement.flipped {
                    Point::new(anchor.x + self.menu_width, anchor.y)
                } else {
                    anchor
                };
                let placement = place_beside(anchor, self.input_width, self.viewport_right);
                self.state = MenuState::NoteInput {
                    info: info.clone(),
                    placement,
                    draft: String::new(),
                };
                MenuOutcome::NoteInputOpened(placement)
            }
            MenuAction::AskAi => {
                let text = info.text.clone().unwrap_or_default();
                self.state = MenuState::Closed;
                MenuOutcome::AskAi { text }
            }
        }
    }

    pub fn set_draft(&mut self, text: &str) {
        if let MenuState::NoteInput { draft, .. } = &mut self.state {
            text.clone_into(draft);
        }
    }

    /// Saves the drafted note at the captured document point. Blank drafts
    /// keep the input open.
    pub fn submit_note(&mut self, store: &ViewerStore) -> Option<Annotation> {
        let MenuState::NoteInput { info, draft, .. } = &self.state else {
            return None;
        };
        if draft.trim().is_empty() {
            return None;
        }
        let note = Annotation::note(self.page, info.pdf_coord, draft.clone());
        debug!(page = self.page, id = %note.id, "note created");
        store.add_annotation(note.clone());
        self.state = MenuState::Closed;
        Some(note)
    }

    pub fn click_outside(&mut self) {
        self.close();
    }

    pub fn close(&mut self) {
        self.state = MenuState::Closed;
    }
}
