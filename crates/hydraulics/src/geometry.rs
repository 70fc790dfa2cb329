//! Plan-view geometry for conflation and clipping: polylines with linear
//! referencing, segment intersection, and point-in-polygon containment.
//! Coordinates are in the source model's projected CRS throughout; no
//! geographic math is needed or attempted.

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn of_points(points: impl IntoIterator<Item = Point>) -> Option<Bbox> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = Bbox {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        for p in iter {
            bbox.min_x = bbox.min_x.min(p.x);
            bbox.min_y = bbox.min_y.min(p.y);
            bbox.max_x = bbox.max_x.max(p.x);
            bbox.max_y = bbox.max_y.max(p.y);
        }
        Some(bbox)
    }

    pub fn buffer(&self, d: f64) -> Bbox {
        Bbox {
            min_x: self.min_x - d,
            min_y: self.min_y - d,
            max_x: self.max_x + d,
            max_y: self.max_y + d,
        }
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    pub fn covers(&self, other: &Bbox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// An intersection between two polylines, located by distance along each.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub station_a: f64,
    pub station_b: f64,
    pub point: Point,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LineString(pub Vec<Point>);

impl LineString {
    pub fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn first(&self) -> Point {
        *self.0.first().expect("line strings are non-empty")
    }

    pub fn last(&self) -> Point {
        *self.0.last().expect("line strings are non-empty")
    }

    pub fn reversed(&self) -> LineString {
        let mut pts = self.0.clone();
        pts.reverse();
        LineString(pts)
    }

    pub fn bbox(&self) -> Bbox {
        Bbox::of_points(self.0.iter().copied()).expect("line strings are non-empty")
    }

    pub fn length(&self) -> f64 {
        self.0.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }

    /// The point at `station` measured from the line's start, clamped to
    /// the line's ends.
    pub fn point_at(&self, station: f64) -> Point {
        if station <= 0.0 {
            return self.first();
        }
        let mut remaining = station;
        for w in self.0.windows(2) {
            let seg = w[0].distance(&w[1]);
            if remaining <= seg && seg > 0.0 {
                let t = remaining / seg;
                return Point::new(
                    w[0].x + t * (w[1].x - w[0].x),
                    w[0].y + t * (w[1].y - w[0].y),
                );
            }
            remaining -= seg;
        }
        self.last()
    }

    /// Project `p` onto the line, returning (station, distance).
    pub fn project(&self, p: &Point) -> (f64, f64) {
        let mut best = (0.0, f64::INFINITY);
        let mut walked = 0.0;
        for w in self.0.windows(2) {
            let (a, b) = (w[0], w[1]);
            let seg = a.distance(&b);
            let (t, d) = if seg == 0.0 {
                (0.0, p.distance(&a))
            } else {
                let t = ((p.x - a.x) * (b.x - a.x) + (p.y - a.y) * (b.y - a.y)) / (seg * seg);
                let t = t.clamp(0.0, 1.0);
                let q = Point::new(a.x + t * (b.x - a.x), a.y + t * (b.y - a.y));
                (t, p.distance(&q))
            };
            if d < best.1 {
                best = (walked + t * seg, d);
            }
            walked += seg;
        }
        best
    }

    pub fn distance_to(&self, p: &Point) -> f64 {
        self.project(p).1
    }

    /// All crossings with `other`, ordered by station along `self`.
    pub fn crossings(&self, other: &LineString) -> Vec<Crossing> {
        let mut out = Vec::new();
        let mut sta_a = 0.0;
        for wa in self.0.windows(2) {
            let seg_a = wa[0].distance(&wa[1]);
            let mut sta_b = 0.0;
            for wb in other.0.windows(2) {
                let seg_b = wb[0].distance(&wb[1]);
                if let Some((t, u, point)) = segment_intersection(wa[0], wa[1], wb[0], wb[1]) {
                    out.push(Crossing {
                        station_a: sta_a + t * seg_a,
                        station_b: sta_b + u * seg_b,
                        point,
                    });
                }
                sta_b += seg_b;
            }
            sta_a += seg_a;
        }
        out.sort_by(|l, r| l.station_a.total_cmp(&r.station_a));
        out
    }

    /// The sub-line between two stations (clamped and ordered).
    pub fn slice(&self, s0: f64, s1: f64) -> LineString {
        let (s0, s1) = if s0 <= s1 { (s0, s1) } else { (s1, s0) };
        let mut pts = vec![self.point_at(s0)];
        let mut walked = 0.0;
        for w in self.0.windows(2) {
            walked += w[0].distance(&w[1]);
            if walked > s0 && walked < s1 {
                pts.push(w[1]);
            }
        }
        pts.push(self.point_at(s1));
        pts.dedup_by(|a, b| a.distance(b) < 1e-9);
        if pts.len() == 1 {
            pts.push(pts[0]);
        }
        LineString(pts)
    }
}

/// Intersection of segments a0->a1 and b0->b1, returned as the parameters
/// along each segment plus the point, or None when parallel or disjoint.
fn segment_intersection(a0: Point, a1: Point, b0: Point, b1: Point) -> Option<(f64, f64, Point)> {
    let r = Point::new(a1.x - a0.x, a1.y - a0.y);
    let s = Point::new(b1.x - b0.x, b1.y - b0.y);
    let denom = r.x * s.y - r.y * s.x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let qp = Point::new(b0.x - a0.x, b0.y - a0.y);
    let t = (qp.x * s.y - qp.y * s.x) / denom;
    let u = (qp.x * r.y - qp.y * r.x) / denom;
    if !(0.0..=1.0).contains(&t) || !(0.0..=1.0).contains(&u) {
        return None;
    }
    Some((t, u, Point::new(a0.x + t * r.x, a0.y + t * r.y)))
}

/// A simple polygon given by its exterior ring (implicitly closed).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point>) -> Self {
        Self { exterior }
    }

    pub fn bbox(&self) -> Bbox {
        Bbox::of_points(self.exterior.iter().copied()).expect("polygons are non-empty")
    }

    /// Even-odd containment test.
    pub fn contains(&self, p: &Point) -> bool {
        let ring = &self.exterior;
        let n = ring.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (ring[i], ring[j]);
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// The corridor polygon spanned by an ordered run of cross sections: the
/// ring walks the sections' first points downstream and their last points
/// back upstream. Sections digitized in alternating directions are flipped
/// so that banks chain consistently.
pub fn corridor(sections: &[LineString]) -> Option<Polygon> {
    if sections.len() < 2 {
        return None;
    }
    let mut oriented: Vec<LineString> = vec![sections[0].clone()];
    for xs in &sections[1..] {
        let prev = oriented.last().unwrap();
        let keep = xs.first().distance(&prev.first()) + xs.last().distance(&prev.last());
        let flip = xs.first().distance(&prev.last()) + xs.last().distance(&prev.first());
        oriented.push(if flip < keep { xs.reversed() } else { xs.clone() });
    }

    let mut ring: Vec<Point> = oriented.iter().map(|l| l.first()).collect();
    ring.extend(oriented.iter().rev().map(|l| l.last()));
    Some(Polygon::new(ring))
}

/// Merge a junction polygon into a corridor by appending its vertices at
/// the corridor's downstream edge, so clipped grids retain the junction area.
pub fn merge_junction(corridor: &Polygon, junction: &Polygon) -> Polygon {
    let n = corridor.exterior.len();
    // The downstream edge joins points n/2-1 and n/2 of the ring.
    let split = n / 2;
    let mut ring = corridor.exterior[..split].to_vec();
    ring.extend(junction.exterior.iter().copied());
    ring.extend_from_slice(&corridor.exterior[split..]);
    Polygon::new(ring)
}

/// Evenly spaced values from `lo` to `hi` inclusive.
pub fn linspace(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..count)
            .map(|i| lo + (hi - lo) * i as f64 / (count - 1) as f64)
            .collect(),
    }
}
