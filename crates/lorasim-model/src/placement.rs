//! Node placement around the gateway.
//!
//! Nodes are either placed randomly inside a disc around the gateway, with a
//! minimum separation between nodes, or taken from a list of coordinates.

use crate::ModelError;
use lorasim_common::Position;
use rand::Rng;
use std::fmt::Write as _;
use std::path::Path;

/// Settings for random placement.
#[derive(Debug, Clone)]
pub struct DiscPlacement {
    /// Disc center.
    pub center: Position,
    /// Disc radius in meters.
    pub radius_m: f64,
    /// Minimum distance between any two nodes in meters.
    pub min_separation_m: f64,
    /// Rejected candidates allowed per node before giving up.
    pub max_rounds: u32,
}

impl DiscPlacement {
    /// Place `count` nodes.
    ///
    /// Each candidate is drawn as `(a, b)` uniform with `a <= b`, at radius
    /// `b * r` and angle `2 * pi * a / b`, which concentrates nodes toward the
    /// center. Candidates closer than the minimum separation to an already
    /// placed node are redrawn.
    pub fn place<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Result<Vec<Position>, ModelError> {
        let mut placed: Vec<Position> = Vec::with_capacity(count);

        for node in 0..count {
            let mut rounds = 0;
            loop {
                let mut a: f64 = rng.gen();
                let mut b: f64 = rng.gen();
                if b < a {
                    std::mem::swap(&mut a, &mut b);
                }

                if b > 0.0 {
                    let angle = 2.0 * std::f64::consts::PI * a / b;
                    let candidate = Position::new(
                        b * self.radius_m * angle.cos() + self.center.x,
                        b * self.radius_m * angle.sin() + self.center.y,
                    );
                    if placed
                        .iter()
                        .all(|p| p.distance_to(&candidate) >= self.min_separation_m)
                    {
                        placed.push(candidate);
                        break;
                    }
                }

                rounds += 1;
                if rounds >= self.max_rounds {
                    return Err(ModelError::PlacementFailed { node, rounds });
                }
            }
        }

        Ok(placed)
    }
}

/// Parse node coordinates, one `x y [id]` row per line.
///
/// Blank lines and `#` comments are skipped. A trailing id column is
/// accepted and ignored; nodes are numbered by row order.
pub fn parse_positions(text: &str) -> Result<Vec<Position>, ModelError> {
    let mut positions = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(2..=3).contains(&fields.len()) {
            return Err(ModelError::InvalidPositions {
                line: idx + 1,
                message: format!("expected 'x y [id]', found {} columns", fields.len()),
            });
        }
        let coordinate = |s: &str| {
            s.parse::<f64>().map_err(|e| ModelError::InvalidPositions {
                line: idx + 1,
                message: format!("bad coordinate '{s}': {e}"),
            })
        };
        positions.push(Position::new(coordinate(fields[0])?, coordinate(fields[1])?));
    }
    Ok(positions)
}

/// Load node coordinates from a file.
pub fn load_positions(path: &Path) -> Result<Vec<Position>, ModelError> {
    let text = std::fs::read_to_string(path)?;
    parse_positions(&text)
}

/// Write node coordinates as `x y id` rows.
pub fn write_positions(path: &Path, positions: &[Position]) -> Result<(), ModelError> {
    let mut out = String::new();
    for (id, p) in positions.iter().enumerate() {
        let _ = writeln!(out, "{} {} {}", p.x, p.y, id);
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Write the gateway coordinates as a single `x y 0` row.
pub fn write_gateway_position(path: &Path, position: Position) -> Result<(), ModelError> {
    std::fs::write(path, format!("{} {} 0\n", position.x, position.y))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn disc() -> DiscPlacement {
        DiscPlacement {
            center: Position::new(200.0, 200.0),
            radius_m: 190.0,
            min_separation_m: 10.0,
            max_rounds: 100,
        }
    }

    #[test]
    fn test_random_placement_inside_disc_and_separated() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let placement = disc();
        let positions = placement.place(50, &mut rng).unwrap();
        assert_eq!(positions.len(), 50);

        for (i, p) in positions.iter().enumerate() {
            assert!(p.distance_to(&placement.center) <= placement.radius_m + 1e-9);
            for q in &positions[i + 1..] {
                assert!(p.distance_to(q) >= placement.min_separation_m);
            }
        }
    }

    #[test]
    fn test_random_placement_is_deterministic() {
        let a = disc().place(20, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        let b = disc().place(20, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_placement_gives_up() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let crowded = DiscPlacement {
            radius_m: 5.0,
            min_separation_m: 50.0,
            ..disc()
        };
        let err = crowded.place(3, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::PlacementFailed { node: 1, rounds: 100 }));
    }

    #[test]
    fn test_parse_positions() {
        let text = "# x y id\n10.5 20 0\n\n30 40.25 1 # trailing comment\n-5 7\n";
        let positions = parse_positions(text).unwrap();
        assert_eq!(
            positions,
            vec![Position::new(10.5, 20.0), Position::new(30.0, 40.25), Position::new(-5.0, 7.0)]
        );
    }

    #[test]
    fn test_parse_positions_rejects_bad_rows() {
        let err = parse_positions("1 2\n3\n").unwrap_err();
        assert!(matches!(err, ModelError::InvalidPositions { line: 2, .. }));
        let err = parse_positions("1 x\n").unwrap_err();
        assert!(matches!(err, ModelError::InvalidPositions { line: 1, .. }));
    }

    #[test]
    fn test_write_and_reload_positions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nodes.txt");
        let positions = vec![Position::new(1.5, 2.0), Position::new(3.0, 4.0)];
        write_positions(&path, &positions).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1.5 2 0\n3 4 1\n");
        assert_eq!(load_positions(&path).unwrap(), positions);

        let gw = dir.path().join("basestation.txt");
        write_gateway_position(&gw, Position::new(10.0, 10.0)).unwrap();
        assert_eq!(std::fs::read_to_string(&gw).unwrap(), "10 10 0\n");
    }
}
