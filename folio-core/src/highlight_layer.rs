//! Translucent overlay for persisted highlights.
//!
//! Every highlight is painted as one fill through the union of its quads,
//! so overlapping quads of the same highlight never darken twice.

use std::sync::Arc;

use image::{Pixel, Rgba, RgbaImage};

use crate::geometry::{effective_ratio, Rect};
use crate::store::ViewerState;
use crate::{Highlight, HighlightId};

/// Union of rectangles a single fill is clipped to, in viewport space.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRegion {
    pub rects: Vec<Rect>,
}

impl ClipRegion {
    pub fn for_highlight(highlight: &Highlight, scale: f64) -> Self {
        Self {
            rects: highlight
                .quads
                .iter()
                .map(|quad| quad.to_viewport(scale))
                .collect(),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.rects
            .iter()
            .any(|r| x >= r.left && x < r.right() && y >= r.top && y < r.bottom())
    }

    pub fn bounds(&self) -> Option<Rect> {
        let mut rects = self.rects.iter();
        let first = *rects.next()?;
        Some(rects.fold(first, |acc, r| acc.union(r)))
    }
}

pub struct HighlightLayer {
    page: usize,
    fill: Rgba<u8>,
    drawn: Option<(Arc<Vec<Highlight>>, f64)>,
}

impl HighlightLayer {
    pub fn new(page: usize, fill: [u8; 4]) -> Self {
        Self {
            page,
            fill: Rgba(fill),
            drawn: None,
        }
    }

    /// True when the highlight list or the scale changed since the last draw.
    pub fn needs_redraw(&self, state: &ViewerState) -> bool {
        match (&self.drawn, state.scale) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((highlights, scale)), Some(current)) => {
                !Arc::ptr_eq(highlights, &state.highlights) || *scale != current
            }
        }
    }

    pub fn regions(&self, state: &ViewerState) -> Vec<(HighlightId, ClipRegion)> {
        let Some(scale) = state.scale else {
            return Vec::new();
        };
        state
            .highlights_on(self.page)
            .map(|h| (h.id, ClipRegion::for_highlight(h, scale)))
            .collect()
    }

    /// Repaints `target` (sized to the page's device pixels) from scratch.
    pub fn draw(&mut self, state: &ViewerState, device_pixel_ratio: f64, target: &mut RgbaImage) {
        for pixel in target.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
        let Some(scale) = state.scale else {
            self.drawn = None;
            return;
        };

        let ratio = effective_ratio(device_pixel_ratio);
        for (_, region) in self.regions(state) {
            paint_region(target, &region, ratio, self.fill);
        }
        self.drawn = Some((Arc::clone(&state.highlights), scale));
    }
}

fn paint_region(target: &mut RgbaImage, region: &ClipRegion, ratio: f64, fill: Rgba<u8>) {
    let Some(bounds) = region.bounds() else {
        return;
    };
    let device = bounds.scaled(ratio);
    let x0 = device.left.floor().max(0.0) as u32;
    let y0 = device.top.floor().max(0.0) as u32;
    let x1 = (device.right().ceil().max(0.0) as u32).min(target.width());
    let y1 = (device.bottom().ceil().max(0.0) as u32).min(target.height());

    for y in y0..y1 {
        for x in x0..x1 {
            let cx = (x as f64 + 0.5) / ratio;
            let cy = (y as f64 + 0.5) / ratio;
            if region.contains(cx, cy) {
                target.get_pixel_mut(x, y).blend(&fill);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ViewerStore;
    use crate::Quad;

    fn quad(x: f64, y: f64, w: f64, h: f64) -> Quad {
        Quad { x, y, w, h }
    }

    #[test]
    fn regions_scale_proportionally() {
        let store = ViewerStore::default();
        store.add_highlight(Highlight::new(1, vec![quad(10.0, 20.0, 30.0, 5.0)]));
        let layer = HighlightLayer::new(1, [255, 255, 0, 128]);

        store.set_scale(1.0);
        let at_one = layer.regions(&store.snapshot());
        store.set_scale(2.5);
        let at_two_and_half = layer.regions(&store.snapshot());

        let a = at_one[0].1.rects[0];
        let b = at_two_and_half[0].1.rects[0];
        assert_eq!(b, a.scaled(2.5));
    }

    #[test]
    fn only_highlights_of_this_page_are_drawn() {
        let store = ViewerStore::default();
        store.set_scale(1.0);
        store.add_highlight(Highlight::new(2, vec![quad(0.0, 0.0, 10.0, 10.0)]));
        let layer = HighlightLayer::new(1, [255, 255, 0, 128]);
        assert!(layer.regions(&store.snapshot()).is_empty());
    }

    #[test]
    fn overlapping_quads_are_filled_once() {
        let store = ViewerStore::default();
        store.set_scale(1.0);
        store.add_highlight(Highlight::new(
            1,
            vec![quad(0.0, 0.0, 6.0, 4.0), quad(4.0, 0.0, 6.0, 4.0)],
        ));
        let mut layer = HighlightLayer::new(1, [255, 0, 0, 128]);
        let mut target = RgbaImage::new(12, 6);

        layer.draw(&store.snapshot(), 1.0, &mut target);

        let single = *target.get_pixel(1, 1);
        let overlap = *target.get_pixel(5, 1);
        assert_eq!(single, overlap);
        assert!(single[3] > 0);
        assert_eq!(target.get_pixel(11, 5)[3], 0);
    }

    #[test]
    fn unusable_ratio_paints_at_one() {
        let store = ViewerStore::default();
        store.set_scale(1.0);
        store.add_highlight(Highlight::new(1, vec![quad(0.0, 0.0, 4.0, 4.0)]));
        let mut layer = HighlightLayer::new(1, [255, 0, 0, 128]);
        let mut target = RgbaImage::new(8, 8);

        layer.draw(&store.snapshot(), 0.0, &mut target);
        assert!(target.get_pixel(2, 2)[3] > 0);
        assert_eq!(target.get_pixel(6, 6)[3], 0);
    }

    #[test]
    fn redraw_tracks_identity_and_scale() {
        let store = ViewerStore::default();
        let mut layer = HighlightLayer::new(1, [255, 0, 0, 128]);
        let mut target = RgbaImage::new(4, 4);
        assert!(!layer.needs_redraw(&store.snapshot()));

        store.set_scale(1.0);
        assert!(layer.needs_redraw(&store.snapshot()));
        layer.draw(&store.snapshot(), 1.0, &mut target);
        assert!(!layer.needs_redraw(&store.snapshot()));

        store.set_tool(crate::Tool::Highlight);
        assert!(!layer.needs_redraw(&store.snapshot()));

        store.add_highlight(Highlight::new(1, vec![quad(0.0, 0.0, 1.0, 1.0)]));
        assert!(layer.needs_redraw(&store.snapshot()));
        layer.draw(&store.snapshot(), 1.0, &mut target);

        store.set_scale(2.0);
        assert!(layer.needs_redraw(&store.snapshot()));
    }
}
