//! Preview size selection against a display envelope

use super::frame::Resolution;

/// HD envelope used when the display itself is smaller than HD
pub const HD_ENVELOPE: Resolution = Resolution::new(1080, 720);

/// Resolution compared by its long and short sides, orientation-independent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartSize {
    pub size: Resolution,
    pub long: u32,
    pub short: u32,
}

impl SmartSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self::from(Resolution::new(width, height))
    }

    /// True if this size fits inside `envelope` in both dimensions
    pub fn fits_within(&self, envelope: &SmartSize) -> bool {
        self.long <= envelope.long && self.short <= envelope.short
    }
}

impl From<Resolution> for SmartSize {
    fn from(size: Resolution) -> Self {
        Self {
            size,
            long: size.long_side(),
            short: size.short_side(),
        }
    }
}

/// Chosen output size with its position in the candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSize {
    pub size: Resolution,
    pub index: usize,
}

/// The envelope a preview must fit in: the display if it is at least HD, else HD
pub fn preview_envelope(display: Resolution) -> SmartSize {
    let hd = SmartSize::from(HD_ENVELOPE);
    let screen = SmartSize::from(display);
    if screen.long >= hd.long || screen.short >= hd.short {
        screen
    } else {
        hd
    }
}

/// Candidates fitting the envelope, largest area first
pub fn valid_preview_sizes(display: Resolution, sizes: &[Resolution]) -> Vec<SmartSize> {
    let envelope = preview_envelope(display);
    let mut valid: Vec<SmartSize> = sizes
        .iter()
        .copied()
        .map(SmartSize::from)
        .filter(|s| s.fits_within(&envelope))
        .collect();
    valid.sort_by_key(|s| std::cmp::Reverse(s.size.pixel_count()));
    valid
}

/// Largest candidate fitting the display envelope
pub fn preview_output_size(display: Resolution, sizes: &[Resolution]) -> Option<OutputSize> {
    let best = valid_preview_sizes(display, sizes).into_iter().next()?;
    let index = find_size(sizes, best.size)?;
    Some(OutputSize {
        size: best.size,
        index,
    })
}

/// Largest candidate by area
pub fn maximum_output_size(sizes: &[Resolution]) -> Option<Resolution> {
    sizes.iter().copied().max_by_key(Resolution::pixel_count)
}

pub fn find_size(sizes: &[Resolution], size: Resolution) -> Option<usize> {
    sizes.iter().position(|s| *s == size)
}
