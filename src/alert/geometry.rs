use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis aligned rectangle in frame pixel coordinates. Used both for the restricted zone and for
/// detection bounding boxes.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
pub struct Rectangle {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rectangle {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// A rectangle is well formed when its first corner is the top left one
    pub fn is_ordered(&self) -> bool {
        self.x1 <= self.x2 && self.y1 <= self.y2
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Boundary inclusive containment test
    pub fn contains(&self, point: Point) -> bool {
        contains(point, self)
    }
}

pub fn contains(point: Point, rect: &Rectangle) -> bool {
    (rect.x1..=rect.x2).contains(&point.x) && (rect.y1..=rect.y2).contains(&point.y)
}
