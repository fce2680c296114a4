//! Single-ray queries against a triangle mesh.

use glam::Vec3;

use super::mesh::TriMesh;

/// Barycentric slack so rays through shared edges and vertices still hit.
const EDGE_EPSILON: f32 = 1e-6;
const PARALLEL_EPSILON: f32 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit direction.
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub point: Vec3,
    pub distance: f32,
    pub triangle: usize,
}

/// Möller–Trumbore intersection; returns the ray parameter of the hit.
pub fn intersect_triangle(ray: &Ray, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let e1 = b - a;
    let e2 = c - a;
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - a;
    let u = s.dot(p) * inv_det;
    if !(-EDGE_EPSILON..=1.0 + EDGE_EPSILON).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < -EDGE_EPSILON || u + v > 1.0 + EDGE_EPSILON {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t > 0.0).then_some(t)
}

/// Slab test against an axis-aligned box.
fn hits_bounds(ray: &Ray, lo: Vec3, hi: Vec3) -> bool {
    let inv = ray.direction.recip();
    let t0 = (lo - ray.origin) * inv;
    let t1 = (hi - ray.origin) * inv;
    let t_near = t0.min(t1).max_element();
    let t_far = t0.max(t1).min_element();
    // NaN from 0 * inf on an axis-parallel ray fails both comparisons
    !(t_far < 0.0 || t_near > t_far)
}

/// Nearest intersection of `ray` with `mesh`, if any.
pub fn cast_nearest(mesh: &TriMesh, ray: &Ray) -> Option<RayHit> {
    if ray.direction == Vec3::ZERO {
        return None;
    }
    let (lo, hi) = mesh.bounds()?;
    let pad = Vec3::splat(1e-6);
    if !hits_bounds(ray, lo - pad, hi + pad) {
        return None;
    }

    let mut best: Option<(f32, usize)> = None;
    for i in 0..mesh.triangle_count() {
        let [a, b, c] = mesh.triangle(i);
        if let Some(t) = intersect_triangle(ray, a, b, c) {
            if best.map_or(true, |(bt, _)| t < bt) {
                best = Some((t, i));
            }
        }
    }
    best.map(|(t, triangle)| RayHit {
        point: ray.at(t),
        distance: t,
        triangle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_hits_unit_sphere_pole() {
        let sphere = TriMesh::uv_sphere(1.0, 16, 32);
        let ray = Ray::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0));
        let hit = cast_nearest(&sphere, &ray).expect("hit");
        assert!((hit.point - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-4, "{:?}", hit.point);
        assert!((hit.distance - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_ray_takes_nearest_surface() {
        let sphere = TriMesh::uv_sphere(1.0, 16, 32);
        let ray = Ray::new(Vec3::new(0.05, 0.03, 5.0), Vec3::new(0.0, 0.0, -1.0));
        let hit = cast_nearest(&sphere, &ray).expect("hit");
        // front surface, not the far side
        assert!(hit.point.z > 0.99);
    }

    #[test]
    fn test_ray_misses_sphere() {
        let sphere = TriMesh::uv_sphere(1.0, 16, 32);
        let beside = Ray::new(Vec3::new(2.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(cast_nearest(&sphere, &beside).is_none());

        let away = Ray::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 1.0));
        assert!(cast_nearest(&sphere, &away).is_none());
    }

    #[test]
    fn test_triangle_edge_counts_as_hit() {
        let ray = Ray::new(Vec3::new(0.5, 0.0, 1.0), Vec3::NEG_Z);
        let t = intersect_triangle(&ray, Vec3::ZERO, Vec3::X, Vec3::Y);
        assert!((t.unwrap() - 1.0).abs() < 1e-6);
    }
}
