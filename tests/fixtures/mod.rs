//! Generated test images

#![allow(dead_code)]

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// A test upload and what the service should do with it.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub filename: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
    pub should_succeed: bool,
    pub description: &'static str,
}

pub const IMAGE_FIXTURES: &[ImageFixture] = &[
    ImageFixture {
        filename: "square.png",
        width: 500,
        height: 500,
        format: Some(ImageFormat::Png),
        should_succeed: true,
        description: "500x500 PNG, reference geometry",
    },
    ImageFixture {
        filename: "landscape.jpg",
        width: 800,
        height: 400,
        format: Some(ImageFormat::Jpeg),
        should_succeed: true,
        description: "800x400 JPEG",
    },
    ImageFixture {
        filename: "narrow.png",
        width: 100,
        height: 600,
        format: Some(ImageFormat::Png),
        should_succeed: true,
        description: "100px wide PNG, crop clamped on the right",
    },
    ImageFixture {
        filename: "sliver.png",
        width: 3,
        height: 300,
        format: Some(ImageFormat::Png),
        should_succeed: false,
        description: "3px wide PNG, crop window outside the image",
    },
    ImageFixture {
        filename: "corrupt.png",
        width: 0,
        height: 0,
        format: None,
        should_succeed: false,
        description: "PNG signature followed by garbage",
    },
];

impl ImageFixture {
    pub fn bytes(&self) -> Vec<u8> {
        match self.format {
            Some(format) => encode(self.width, self.height, format),
            None => corrupt_png(),
        }
    }
}

/// Encode a gradient image of the given size.
pub fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, format)
        .expect("encode fixture image");
    out.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

/// Passes header sniffing, fails decoding.
pub fn corrupt_png() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(b"definitely not an IHDR chunk");
    bytes
}
