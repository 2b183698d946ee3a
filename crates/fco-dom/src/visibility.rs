//! Visibility
//!
//! Cheap visibility heuristics for observed elements.
//!
//! - `display: none`, `visibility: hidden`, zero opacity → invisible
//! - zero-sized box → invisible
//! - outside the viewport → offscreen (still visible, processed lazily)

/// Visibility state of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityState {
    /// Element is visible and in viewport.
    #[default]
    Visible,

    /// Element has `visibility: hidden` or zero opacity.
    Hidden,

    /// Element has `display: none`.
    DisplayNone,

    /// Element has an empty box.
    Collapsed,

    /// Element is outside the viewport.
    Offscreen,
}

impl VisibilityState {
    /// Is the element completely invisible (not merely offscreen)?
    #[inline]
    pub fn is_invisible(&self) -> bool {
        matches!(
            self,
            VisibilityState::Hidden | VisibilityState::DisplayNone | VisibilityState::Collapsed
        )
    }

    /// Is the element offscreen?
    #[inline]
    pub fn is_offscreen(&self) -> bool {
        matches!(self, VisibilityState::Offscreen)
    }
}

/// Viewport for visibility testing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1280.0, 800.0)
    }
}

impl Viewport {
    /// Create a new viewport.
    #[inline]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Right edge.
    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// Bottom edge.
    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Check if a rectangle intersects the viewport.
    #[inline]
    pub fn intersects(&self, x: f32, y: f32, w: f32, h: f32) -> bool {
        x < self.right() && x + w > self.x && y < self.bottom() && y + h > self.y
    }

    /// Expand viewport by a margin (for lazy loading ahead of scroll).
    #[inline]
    pub fn expand(&self, margin: f32) -> Viewport {
        Viewport {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }
}

/// Element box and the computed-style bits relevant to visibility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementVisibility {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,

    /// CSS display value (simplified).
    pub display: DisplayValue,

    /// CSS visibility value.
    pub visibility: VisibilityValue,

    /// CSS opacity value (0.0 to 1.0).
    pub opacity: f32,
}

impl Default for ElementVisibility {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            display: DisplayValue::Block,
            visibility: VisibilityValue::Visible,
            opacity: 1.0,
        }
    }
}

/// Simplified CSS display values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayValue {
    #[default]
    Block,
    Inline,
    Flex,
    Grid,
    None,
    Contents,
}

/// CSS visibility values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityValue {
    #[default]
    Visible,
    Hidden,
    Collapse,
}

impl ElementVisibility {
    /// Visible box at the given position.
    pub fn boxed(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }

    /// Viewport independent part of the state.
    pub fn intrinsic_state(&self) -> VisibilityState {
        // display: none takes priority
        if self.display == DisplayValue::None {
            return VisibilityState::DisplayNone;
        }
        if self.visibility != VisibilityValue::Visible || self.opacity <= 0.0 {
            return VisibilityState::Hidden;
        }
        // display: contents has no box of its own
        if self.display != DisplayValue::Contents && self.width <= 0.0 && self.height <= 0.0 {
            return VisibilityState::Collapsed;
        }
        VisibilityState::Visible
    }

    /// Compute visibility state relative to viewport.
    pub fn compute_state(&self, viewport: &Viewport) -> VisibilityState {
        let state = self.intrinsic_state();
        if state.is_invisible() {
            return state;
        }
        if !viewport.intersects(self.x, self.y, self.width, self.height) {
            return VisibilityState::Offscreen;
        }
        VisibilityState::Visible
    }

    /// Is the box within `margin` pixels of the viewport?
    pub fn approaches(&self, viewport: &Viewport, margin: f32) -> bool {
        viewport
            .expand(margin)
            .intersects(self.x, self.y, self.width, self.height)
    }
}
