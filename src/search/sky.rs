use serde::Serialize;

/// An ICRS position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SkyCoord {
    pub ra: f64,
    pub dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    fn unit_vector(self) -> [f64; 3] {
        let (ra, dec) = (self.ra.to_radians(), self.dec.to_radians());
        [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
    }

    /// Great-circle separation in degrees (Vincenty formula, stable at all
    /// separations).
    pub fn separation(self, other: SkyCoord) -> f64 {
        let (ra1, dec1) = (self.ra.to_radians(), self.dec.to_radians());
        let (ra2, dec2) = (other.ra.to_radians(), other.dec.to_radians());
        let dra = ra2 - ra1;
        let (sin_d1, cos_d1) = dec1.sin_cos();
        let (sin_d2, cos_d2) = dec2.sin_cos();

        let num1 = cos_d2 * dra.sin();
        let num2 = cos_d1 * sin_d2 - sin_d1 * cos_d2 * dra.cos();
        let denom = sin_d1 * sin_d2 + cos_d1 * cos_d2 * dra.cos();
        num1.hypot(num2).atan2(denom).to_degrees()
    }

    /// Decimal degrees at 6 decimals, RA first.
    pub fn to_decimal_string(self) -> String {
        format!("{:.6} {:.6}", self.ra, self.dec)
    }
}

impl std::fmt::Display for SkyCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

/// Nearest-neighbour lookup over a fixed coordinate set.
///
/// Positions are stored as unit vectors; the closest point on the sphere is
/// the one with the largest dot product, so a linear pass suffices for
/// worklist-sized catalogues.
#[derive(Debug, Clone)]
pub struct SkyIndex {
    coords: Vec<SkyCoord>,
    vectors: Vec<[f64; 3]>,
}

impl SkyIndex {
    pub fn new(coords: Vec<SkyCoord>) -> Self {
        let vectors = coords.iter().map(|c| c.unit_vector()).collect();
        Self { coords, vectors }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Index of the closest stored position and its separation in degrees.
    /// Ties go to the lower index.
    pub fn nearest(&self, target: SkyCoord) -> Option<(usize, f64)> {
        let t = target.unit_vector();
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in self.vectors.iter().enumerate() {
            let dot = v[0] * t[0] + v[1] * t[1] + v[2] * t[2];
            if !dot.is_finite() {
                continue;
            }
            if best.is_none_or(|(_, d)| dot > d) {
                best = Some((i, dot));
            }
        }
        best.map(|(i, _)| (i, self.coords[i].separation(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separation() {
        let a = SkyCoord::new(10.0, -30.0);
        assert_eq!(a.separation(a), 0.0);
        let b = SkyCoord::new(10.0, -29.0);
        assert!((a.separation(b) - 1.0).abs() < 1e-9);
        let pole = SkyCoord::new(0.0, 90.0);
        assert!((SkyCoord::new(123.0, 0.0).separation(pole) - 90.0).abs() < 1e-9);
        // Across the RA wrap
        let c = SkyCoord::new(359.9, 0.0);
        let d = SkyCoord::new(0.1, 0.0);
        assert!((c.separation(d) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_decimal_string() {
        assert_eq!(SkyCoord::new(10.0, -30.0).to_decimal_string(), "10.000000 -30.000000");
        assert_eq!(SkyCoord::new(3.5812345678, 0.5).to_string(), "3.581235 0.500000");
    }

    #[test]
    fn test_nearest_skips_non_finite_positions() {
        let index = SkyIndex::new(vec![
            SkyCoord::new(f64::NAN, f64::NAN),
            SkyCoord::new(10.0, -30.0),
        ]);
        let (i, sep) = index.nearest(SkyCoord::new(10.0, -30.0)).unwrap();
        assert_eq!(i, 1);
        assert!(sep < 1e-9);

        let only_bad = SkyIndex::new(vec![SkyCoord::new(f64::INFINITY, 0.0)]);
        assert!(only_bad.nearest(SkyCoord::new(10.0, -30.0)).is_none());
    }

    #[test]
    fn test_nearest() {
        let index = SkyIndex::new(vec![
            SkyCoord::new(359.99, 0.0),
            SkyCoord::new(10.0, -30.0),
            SkyCoord::new(10.01, -30.0),
        ]);
        let (i, sep) = index.nearest(SkyCoord::new(10.0, -30.0)).unwrap();
        assert_eq!(i, 1);
        assert!(sep < 1e-9);
        let (i, _) = index.nearest(SkyCoord::new(0.005, 0.0)).unwrap();
        assert_eq!(i, 0);
        assert!(SkyIndex::new(vec![]).nearest(SkyCoord::new(0.0, 0.0)).is_none());
    }
}
