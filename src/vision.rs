//! Rotated enclosing rectangles of segmentation masks.

use image::{GrayImage, Rgb, RgbImage};
use nalgebra::{Point2, Vector2};

/// Minimum-area rectangle at arbitrary orientation, in pixels.
///
/// `angle` is in degrees, normalized to `[-45, 45)`; `size` is measured along
/// the rotated x axis (`size.0`) and the rotated y axis (`size.1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: Point2<f64>,
    pub size: (f64, f64),
    pub angle: f64,
}

impl RotatedRect {
    /// Corners in drawing order.
    pub fn corners(&self) -> [Point2<f64>; 4] {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let u = Vector2::new(cos, sin) * (self.size.0 / 2.0);
        let v = Vector2::new(-sin, cos) * (self.size.1 / 2.0);
        [
            self.center - u - v,
            self.center + u - v,
            self.center + u + v,
            self.center - u + v,
        ]
    }
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain; returns the hull counter-clockwise without repeats.
fn convex_hull(mut points: Vec<Point2<f64>>) -> Vec<Point2<f64>> {
    points.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    points.dedup();
    if points.len() < 3 {
        return points;
    }
    let mut lower: Vec<Point2<f64>> = Vec::new();
    for p in &points {
        while lower.len() >= 2 && cross(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<Point2<f64>> = Vec::new();
    for p in points.iter().rev() {
        while upper.len() >= 2 && cross(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Leftmost and rightmost set pixel of every row; enough to span the hull.
fn row_extremes(mask: &GrayImage) -> Vec<Point2<f64>> {
    let mut points = Vec::new();
    for y in 0..mask.height() {
        let mut first = None;
        let mut last = None;
        for x in 0..mask.width() {
            if mask.get_pixel(x, y)[0] > 0 {
                first.get_or_insert(x);
                last = Some(x);
            }
        }
        if let (Some(first), Some(last)) = (first, last) {
            points.push(Point2::new(f64::from(first), f64::from(y)));
            points.push(Point2::new(f64::from(last), f64::from(y)));
        }
    }
    points
}

/// Minimum-area rotated rectangle around every non-zero pixel of `mask`.
/// Returns `None` for an empty mask.
pub fn mask_to_rotated_rect(mask: &GrayImage) -> Option<RotatedRect> {
    let hull = convex_hull(row_extremes(mask));
    match hull.len() {
        0 => return None,
        1 => {
            return Some(RotatedRect {
                center: hull[0],
                size: (0.0, 0.0),
                angle: 0.0,
            })
        }
        _ => {}
    }

    let mut best: Option<(f64, RotatedRect)> = None;
    for i in 0..hull.len() {
        let edge = hull[(i + 1) % hull.len()] - hull[i];
        let length = edge.norm();
        if length == 0.0 {
            continue;
        }
        let u = edge / length;
        let v = Vector2::new(-u.y, u.x);
        let (mut min_u, mut max_u, mut min_v, mut max_v) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in &hull {
            let d = *p - hull[i];
            let (pu, pv) = (d.dot(&u), d.dot(&v));
            min_u = min_u.min(pu);
            max_u = max_u.max(pu);
            min_v = min_v.min(pv);
            max_v = max_v.max(pv);
        }
        let area = (max_u - min_u) * (max_v - min_v);
        if best.as_ref().map_or(true, |(best_area, _)| area < *best_area) {
            let center = hull[i] + u * ((min_u + max_u) / 2.0) + v * ((min_v + max_v) / 2.0);
            let rect = RotatedRect {
                center,
                size: (max_u - min_u, max_v - min_v),
                angle: u.y.atan2(u.x).to_degrees(),
            };
            best = Some((area, rect));
        }
    }
    best.map(|(_, rect)| normalize_angle(rect))
}

fn normalize_angle(mut rect: RotatedRect) -> RotatedRect {
    while rect.angle >= 45.0 {
        rect.angle -= 90.0;
        rect.size = (rect.size.1, rect.size.0);
    }
    while rect.angle < -45.0 {
        rect.angle += 90.0;
        rect.size = (rect.size.1, rect.size.0);
    }
    rect
}

fn draw_line(image: &mut RgbImage, from: Point2<f64>, to: Point2<f64>, color: Rgb<u8>) {
    let steps = (to - from).amax().ceil().max(1.0) as usize;
    for step in 0..=steps {
        let p = from + (to - from) * (step as f64 / steps as f64);
        let (x, y) = (p.x.round(), p.y.round());
        if x >= 0.0 && y >= 0.0 && (x as u32) < image.width() && (y as u32) < image.height() {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Outlines `rect` on `image`; parts outside the image are clipped.
pub fn draw_rotated_rect(image: &mut RgbImage, rect: &RotatedRect, color: Rgb<u8>) {
    let corners = rect.corners();
    for i in 0..4 {
        draw_line(image, corners[i], corners[(i + 1) % 4], color);
    }
}
