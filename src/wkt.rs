//! Minimal WKT reader for polygonal geometries.
//!
//! Accepts `POLYGON` and `MULTIPOLYGON` (optionally with a `Z`, `M` or `ZM`
//! tag and an `SRID=n;` prefix), and `... EMPTY`. Extra ordinates beyond X
//! and Y are read and dropped.

use geo::{Coord, LineString, MultiPolygon, Polygon};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WktError {
    #[error("unsupported geometry type '{0}'")]
    Unsupported(String),
    #[error("unexpected end of text")]
    UnexpectedEnd,
    #[error("expected '{expected}' at offset {offset}")]
    Expected { expected: char, offset: usize },
    #[error("invalid number '{0}'")]
    Number(String),
    #[error("coordinate needs at least two ordinates")]
    ShortCoordinate,
    #[error("ring has {0} coordinate(s); at least 3 are required")]
    ShortRing(usize),
    #[error("trailing text at offset {0}")]
    Trailing(usize),
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Cursor { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.text[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), WktError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(_) => Err(WktError::Expected {
                expected,
                offset: self.pos,
            }),
            None => Err(WktError::UnexpectedEnd),
        }
    }

    fn word(&mut self) -> &'a str {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn number(&mut self) -> Result<f64, WktError> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
            .unwrap_or(rest.len());
        if len == 0 {
            return match rest.chars().next() {
                Some(_) => Err(WktError::Number(rest.chars().take(12).collect())),
                None => Err(WktError::UnexpectedEnd),
            };
        }
        let token = &rest[..len];
        let value = token
            .parse::<f64>()
            .map_err(|_| WktError::Number(token.to_string()))?;
        self.pos += len;
        Ok(value)
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }
}

fn coordinate(cursor: &mut Cursor<'_>) -> Result<Coord<f64>, WktError> {
    let mut ordinates = Vec::with_capacity(4);
    while matches!(cursor.peek(), Some(c) if c != ',' && c != ')') {
        ordinates.push(cursor.number()?);
    }
    if ordinates.len() < 2 {
        return Err(WktError::ShortCoordinate);
    }
    Ok(Coord {
        x: ordinates[0],
        y: ordinates[1],
    })
}

fn ring(cursor: &mut Cursor<'_>) -> Result<LineString<f64>, WktError> {
    cursor.expect('(')?;
    let mut coords = vec![coordinate(cursor)?];
    while cursor.peek() == Some(',') {
        cursor.expect(',')?;
        coords.push(coordinate(cursor)?);
    }
    cursor.expect(')')?;
    let distinct = if coords.len() > 1 && coords.first() == coords.last() {
        coords.len() - 1
    } else {
        coords.len()
    };
    if distinct < 3 {
        return Err(WktError::ShortRing(distinct));
    }
    Ok(LineString::from(coords))
}

fn polygon_body(cursor: &mut Cursor<'_>) -> Result<Polygon<f64>, WktError> {
    cursor.expect('(')?;
    let exterior = ring(cursor)?;
    let mut interiors = Vec::new();
    while cursor.peek() == Some(',') {
        cursor.expect(',')?;
        interiors.push(ring(cursor)?);
    }
    cursor.expect(')')?;
    Ok(Polygon::new(exterior, interiors))
}

fn is_empty_tag(cursor: &mut Cursor<'_>) -> bool {
    let saved = cursor.pos;
    if cursor.word().eq_ignore_ascii_case("EMPTY") {
        return true;
    }
    cursor.pos = saved;
    false
}

/// Parses a POLYGON or MULTIPOLYGON into a multipolygon.
pub fn parse_polygonal(text: &str) -> Result<MultiPolygon<f64>, WktError> {
    let body = match text.trim_start().get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("SRID=") => text
            .split_once(';')
            .map(|(_, rest)| rest)
            .ok_or(WktError::UnexpectedEnd)?,
        _ => text,
    };
    let mut cursor = Cursor::new(body);
    let kind = cursor.word().to_ascii_uppercase();
    let saved = cursor.pos;
    let tag = cursor.word().to_ascii_uppercase();
    if !matches!(tag.as_str(), "Z" | "M" | "ZM") {
        cursor.pos = saved;
    }

    let geometry = match kind.as_str() {
        "POLYGON" => {
            if is_empty_tag(&mut cursor) {
                MultiPolygon::new(Vec::new())
            } else {
                MultiPolygon::new(vec![polygon_body(&mut cursor)?])
            }
        }
        "MULTIPOLYGON" => {
            if is_empty_tag(&mut cursor) {
                MultiPolygon::new(Vec::new())
            } else {
                cursor.expect('(')?;
                let mut polygons = vec![polygon_body(&mut cursor)?];
                while cursor.peek() == Some(',') {
                    cursor.expect(',')?;
                    polygons.push(polygon_body(&mut cursor)?);
                }
                cursor.expect(')')?;
                MultiPolygon::new(polygons)
            }
        }
        "" => return Err(WktError::UnexpectedEnd),
        other => return Err(WktError::Unsupported(other.to_string())),
    };
    if !cursor.at_end() {
        return Err(WktError::Trailing(cursor.pos));
    }
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Contains, point};

    #[test]
    fn parses_polygon_with_hole() {
        let shape = parse_polygonal(
            "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (4 4, 6 4, 6 6, 4 6, 4 4))",
        )
        .expect("valid polygon");
        assert_eq!(shape.0.len(), 1);
        assert_eq!(shape.0[0].interiors().len(), 1);
        assert!((shape.unsigned_area() - 96.0).abs() < 1e-9);
        assert!(shape.contains(&point!(x: 2.0, y: 2.0)));
        assert!(!shape.contains(&point!(x: 5.0, y: 5.0)));
    }

    #[test]
    fn parses_multipolygon_case_insensitively() {
        let shape = parse_polygonal(
            "multipolygon(((0 0,1 0,1 1,0 0)),((5 5,6 5,6 6,5 5)))",
        )
        .expect("valid multipolygon");
        assert_eq!(shape.0.len(), 2);
    }

    #[test]
    fn drops_extra_ordinates_and_srid() {
        let shape = parse_polygonal("SRID=4326;POLYGON Z ((0 0 1, 4 0 1, 4 4 1, 0 0 1))")
            .expect("3d polygon");
        assert_eq!(shape.0[0].exterior().0[1], Coord { x: 4.0, y: 0.0 });
    }

    #[test]
    fn empty_geometry_is_accepted() {
        assert!(parse_polygonal("POLYGON EMPTY").expect("empty").0.is_empty());
    }

    #[test]
    fn rejects_other_geometries_and_garbage() {
        assert_eq!(
            parse_polygonal("POINT (1 2)"),
            Err(WktError::Unsupported("POINT".to_string()))
        );
        assert!(matches!(
            parse_polygonal("POLYGON ((0 0, 1 1))"),
            Err(WktError::ShortRing(2))
        ));
        assert!(parse_polygonal("POLYGON ((0 0, 1 0, 1 1, 0 0)").is_err());
        assert!(parse_polygonal("POLYGON ((0 0, 1 0, 1 1, 0 0)) extra").is_err());
        assert!(parse_polygonal("").is_err());
    }
}
