//! Planar helpers for cell construction: convex hull, half-plane clipping,
//! ring area.

use crate::projection::GeoPoint;
use crate::raster::BoundingBox;

#[inline]
pub(crate) fn cross(o: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Convex hull (Andrew's monotone chain), counter-clockwise, collinear
/// points removed. Fewer than three distinct points come back as-is.
pub(crate) fn convex_hull(points: &[GeoPoint]) -> Vec<GeoPoint> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<GeoPoint> = Vec::with_capacity(2 * pts.len());
    for &p in &pts {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower_len = hull.len() + 1;
    for &p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

/// True when `p` lies strictly inside the counter-clockwise convex `hull`,
/// more than `eps` (in cross-product units) away from every edge.
pub(crate) fn strictly_inside(hull: &[GeoPoint], p: GeoPoint, eps: f64) -> bool {
    if hull.len() < 3 {
        return false;
    }
    (0..hull.len()).all(|i| cross(hull[i], hull[(i + 1) % hull.len()], p) > eps)
}

/// Keep the part of `poly` where `normal · p <= offset` (Sutherland–Hodgman, one edge).
pub(crate) fn clip_half_plane(poly: &[GeoPoint], normal: GeoPoint, offset: f64) -> Vec<GeoPoint> {
    let n = poly.len();
    let mut out = Vec::with_capacity(n + 1);
    for i in 0..n {
        let cur = poly[i];
        let next = poly[(i + 1) % n];
        let dc = normal.dot(cur) - offset;
        let dn = normal.dot(next) - offset;
        if dc <= 0.0 {
            out.push(cur);
        }
        if (dc < 0.0 && dn > 0.0) || (dc > 0.0 && dn < 0.0) {
            let t = dc / (dc - dn);
            out.push(cur + (next - cur) * t);
        }
    }
    out
}

/// Keep the part of `poly` closer to `site` than to `other`.
pub(crate) fn clip_bisector(poly: &[GeoPoint], site: GeoPoint, other: GeoPoint) -> Vec<GeoPoint> {
    let normal = other - site;
    let mid = (site + other) * 0.5;
    clip_half_plane(poly, normal, normal.dot(mid))
}

pub(crate) fn clip_to_rect(poly: &[GeoPoint], rect: &BoundingBox) -> Vec<GeoPoint> {
    let mut out = clip_half_plane(poly, GeoPoint::new(-1.0, 0.0), -rect.min_x);
    out = clip_half_plane(&out, GeoPoint::new(1.0, 0.0), rect.max_x);
    out = clip_half_plane(&out, GeoPoint::new(0.0, -1.0), -rect.min_y);
    clip_half_plane(&out, GeoPoint::new(0.0, 1.0), rect.max_y)
}

/// Counter-clockwise corners of `rect`.
pub(crate) fn rect_ring(rect: &BoundingBox) -> Vec<GeoPoint> {
    vec![
        GeoPoint::new(rect.min_x, rect.min_y),
        GeoPoint::new(rect.max_x, rect.min_y),
        GeoPoint::new(rect.max_x, rect.max_y),
        GeoPoint::new(rect.min_x, rect.max_y),
    ]
}

/// Shoelace area of an open or closed ring; positive when counter-clockwise.
pub(crate) fn signed_area(ring: &[GeoPoint]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    // relative to the first vertex, projected coordinates are large
    let o = ring[0];
    let twice: f64 = (0..n)
        .map(|i| {
            let a = ring[i] - o;
            let b = ring[(i + 1) % n] - o;
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice / 2.0
}
