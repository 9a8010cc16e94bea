//! Derivation of the preview sizes to render for every file.
//!
//! Defaults grow as powers of four starting at 64 up to the configured
//! maximum dimensions. Administrators can only narrow those defaults with
//! explicit size lists, except for cover previews which have no defaults and
//! are validated on their own.

use serde::{Deserialize, Serialize};

const BASE_SIZE: i32 = 64;
const GROWTH_FACTOR: i32 = 4;

/// How a non-cropped square preview fits the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Fit inside the box, keeping the whole image visible
    Fill,
    /// Cover the whole box, possibly exceeding it on one axis
    Cover,
}

/// One preview to render. `-1` on an axis leaves that axis unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenderSpecification {
    /// Target width or `-1`
    pub width: i32,
    /// Target height or `-1`
    pub height: i32,
    /// Whether the output is cropped to exactly `width`x`height`
    pub crop: bool,
    /// Scale mode of non-cropped squares
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ScaleMode>,
}

impl RenderSpecification {
    fn square_cropped(size: i32) -> Self {
        Self { width: size, height: size, crop: true, mode: None }
    }

    fn square(size: i32, mode: ScaleMode) -> Self {
        Self { width: size, height: size, crop: false, mode: Some(mode) }
    }

    fn height_only(size: i32) -> Self {
        Self { width: -1, height: size, crop: false, mode: None }
    }

    fn width_only(size: i32) -> Self {
        Self { width: size, height: -1, crop: false, mode: None }
    }
}

/// Administrator provided size lists.
///
/// Every list is a space separated string of non-negative integers. `None`
/// keeps the computed defaults, an empty string disables the family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SizeOverrides {
    /// Square cropped previews
    pub square_sizes: Option<String>,
    /// Former name of [`SizeOverrides::fill_width_height_sizes`]
    pub square_uncropped_sizes: Option<String>,
    /// Square previews scaled to fit
    pub fill_width_height_sizes: Option<String>,
    /// Square previews scaled to cover, no defaults
    pub cover_width_height_sizes: Option<String>,
    /// Previews constrained in width only
    pub width_sizes: Option<String>,
    /// Previews constrained in height only
    pub height_sizes: Option<String>,
}

impl SizeOverrides {
    fn fill(&self) -> Option<&str> {
        self.fill_width_height_sizes
            .as_deref()
            .or(self.square_uncropped_sizes.as_deref())
    }
}

/// Parse a size list. Tokens that are not plain digit strings are ignored.
fn parse_sizes(raw: Option<&str>) -> Option<Vec<i32>> {
    let raw = raw?;
    Some(
        raw.split(' ')
            .filter(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|token| token.parse().ok())
            .collect(),
    )
}

fn progression(mut fits: impl FnMut(i32) -> bool) -> Vec<i32> {
    let mut sizes = Vec::new();
    let mut size = BASE_SIZE;
    while fits(size) {
        sizes.push(size);
        size = match size.checked_mul(GROWTH_FACTOR) {
            Some(next) => next,
            None => break,
        };
    }
    sizes
}

/// Keep the defaults that also appear in the override list, in default order.
fn narrow(defaults: Vec<i32>, overrides: Option<Vec<i32>>) -> Vec<i32> {
    match overrides {
        Some(allowed) => defaults.into_iter().filter(|size| allowed.contains(size)).collect(),
        None => defaults,
    }
}

fn is_power_of_two(size: i32) -> bool {
    size > 0 && size & (size - 1) == 0
}

/// Compute the full list of previews to render.
///
/// The result is ordered square cropped, square fill, square cover, height
/// only, width only.
pub fn generate_specifications(
    max_width: u32,
    max_height: u32,
    overrides: &SizeOverrides,
) -> Vec<RenderSpecification> {
    let max_width = i64::from(max_width);
    let max_height = i64::from(max_height);
    let fits_width = |size: i32| i64::from(size) <= max_width;
    let fits_height = |size: i32| i64::from(size) <= max_height;
    let fits_square = |size: i32| fits_width(size) || fits_height(size);

    let square = narrow(
        progression(fits_square),
        parse_sizes(overrides.square_sizes.as_deref()),
    );
    let fill = narrow(progression(fits_square), parse_sizes(overrides.fill()));
    let cover: Vec<i32> = parse_sizes(overrides.cover_width_height_sizes.as_deref())
        .unwrap_or_default()
        .into_iter()
        .filter(|&size| fits_width(size) && fits_height(size) && is_power_of_two(size))
        .collect();
    let width = narrow(
        progression(fits_width),
        parse_sizes(overrides.width_sizes.as_deref()),
    );
    let height = narrow(
        progression(fits_height),
        parse_sizes(overrides.height_sizes.as_deref()),
    );

    square
        .into_iter()
        .map(RenderSpecification::square_cropped)
        .chain(fill.into_iter().map(|size| RenderSpecification::square(size, ScaleMode::Fill)))
        .chain(cover.into_iter().map(|size| RenderSpecification::square(size, ScaleMode::Cover)))
        .chain(height.into_iter().map(RenderSpecification::height_only))
        .chain(width.into_iter().map(RenderSpecification::width_only))
        .collect()
}
