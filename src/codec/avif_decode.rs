//! AVIF decoding via `avif-parse` (container) and `rav1d` (AV1 bitstream).
//!
//! The `image` crate's `"avif"` feature only enables the rav1e encoder; its
//! decoder needs the C dav1d library. rav1d is the pure Rust port, driven
//! here through its dav1d-compatible API. Used for AVIF sources and for
//! verifying freshly encoded AVIF outputs.
//!
//! The decoder context and the decoded picture are released on every exit
//! path, including errors.

use super::backend::CodecError;
use image::DynamicImage;
use rav1d::include::dav1d::data::Dav1dData;
use rav1d::include::dav1d::dav1d::Dav1dSettings;
use rav1d::include::dav1d::headers::{
    DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
    DAV1D_PIXEL_LAYOUT_I444,
};
use rav1d::include::dav1d::picture::Dav1dPicture;
use rav1d::src::lib as dav1d;
use std::ptr::NonNull;

/// Decode an AVIF file held in memory to RGB8.
pub(crate) fn decode_avif(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    let avif = avif_parse::read_avif(&mut std::io::Cursor::new(bytes))
        .map_err(|e| CodecError::Decode(format!("AVIF container: {e:?}")))?;
    let av1: &[u8] = &avif.primary_item;
    if av1.is_empty() {
        return Err(CodecError::Decode("AVIF has no primary item data".into()));
    }

    let mut settings = std::mem::MaybeUninit::<Dav1dSettings>::uninit();
    let settings_ptr = NonNull::new(settings.as_mut_ptr())
        .ok_or_else(|| CodecError::Decode("rav1d settings allocation".into()))?;
    unsafe { dav1d::dav1d_default_settings(settings_ptr) };
    let mut settings = unsafe { settings.assume_init() };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;

    let mut ctx = None;
    let rc = unsafe { dav1d::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(CodecError::Decode(format!("rav1d open failed ({})", rc.0)));
    }

    let decoded = (|| {
        let mut data = Dav1dData::default();
        let buf = unsafe { dav1d::dav1d_data_create(NonNull::new(&mut data), av1.len()) };
        if buf.is_null() {
            return Err(CodecError::Decode("rav1d data_create failed".into()));
        }
        unsafe { std::ptr::copy_nonoverlapping(av1.as_ptr(), buf, av1.len()) };

        let rc = unsafe { dav1d::dav1d_send_data(ctx, NonNull::new(&mut data)) };
        if rc.0 != 0 {
            unsafe { dav1d::dav1d_data_unref(NonNull::new(&mut data)) };
            return Err(CodecError::Decode(format!(
                "rav1d send_data failed ({})",
                rc.0
            )));
        }

        let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
        let rc = unsafe { dav1d::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
        if rc.0 != 0 {
            return Err(CodecError::Decode(format!(
                "rav1d get_picture failed ({})",
                rc.0
            )));
        }

        let converted = picture_to_rgb(&pic);
        unsafe { dav1d::dav1d_picture_unref(NonNull::new(&mut pic)) };
        converted
    })();

    unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
    decoded
}

/// Convert a decoded picture to an RGB8 image. Does not release `pic`.
fn picture_to_rgb(pic: &Dav1dPicture) -> Result<DynamicImage, CodecError> {
    let width = pic.p.w as u32;
    let height = pic.p.h as u32;
    let layout = pic.p.layout;
    let plane = |i: usize| {
        pic.data[i]
            .map(|p| p.as_ptr() as *const u8)
            .ok_or_else(|| CodecError::Decode(format!("AVIF picture is missing plane {i}")))
    };
    let y_ptr = plane(0)?;

    let planes = if layout == DAV1D_PIXEL_LAYOUT_I400 {
        YuvPlanes {
            y_ptr,
            u_ptr: y_ptr,
            v_ptr: y_ptr,
            y_stride: pic.stride[0],
            uv_stride: 0,
            width,
            height,
            bpc: pic.p.bpc as u32,
            subsampling: (false, false),
            monochrome: true,
        }
    } else {
        let subsampling = match layout {
            DAV1D_PIXEL_LAYOUT_I420 => (true, true),
            DAV1D_PIXEL_LAYOUT_I422 => (true, false),
            DAV1D_PIXEL_LAYOUT_I444 => (false, false),
            other => {
                return Err(CodecError::Decode(format!(
                    "unsupported AVIF pixel layout {other}"
                )));
            }
        };
        YuvPlanes {
            y_ptr,
            u_ptr: plane(1)?,
            v_ptr: plane(2)?,
            y_stride: pic.stride[0],
            uv_stride: pic.stride[1],
            width,
            height,
            bpc: pic.p.bpc as u32,
            subsampling,
            monochrome: false,
        }
    };

    image::RgbImage::from_raw(width, height, planes.to_rgb())
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| CodecError::Decode("decoded AVIF buffer has the wrong size".into()))
}

/// Borrowed YUV planes of a rav1d picture.
struct YuvPlanes {
    y_ptr: *const u8,
    u_ptr: *const u8,
    v_ptr: *const u8,
    y_stride: isize,
    uv_stride: isize,
    width: u32,
    height: u32,
    bpc: u32,
    /// Horizontal, vertical chroma subsampling.
    subsampling: (bool, bool),
    monochrome: bool,
}

impl YuvPlanes {
    /// BT.601 YCbCr to interleaved RGB8.
    fn to_rgb(&self) -> Vec<u8> {
        let max_val = ((1u32 << self.bpc) - 1) as f32;
        let center = (1u32 << (self.bpc - 1)) as f32;
        let scale = 255.0 / max_val;
        let (ss_x, ss_y) = self.subsampling;

        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for row in 0..self.height {
            for col in 0..self.width {
                let y = self.sample(self.y_ptr, self.y_stride, col, row);
                let pixel = if self.monochrome {
                    let v = (y * scale).clamp(0.0, 255.0) as u8;
                    [v, v, v]
                } else {
                    let cx = if ss_x { col / 2 } else { col };
                    let cy = if ss_y { row / 2 } else { row };
                    let cb = self.sample(self.u_ptr, self.uv_stride, cx, cy) - center;
                    let cr = self.sample(self.v_ptr, self.uv_stride, cx, cy) - center;
                    [
                        ((y + 1.402 * cr) * scale).clamp(0.0, 255.0) as u8,
                        ((y - 0.344136 * cb - 0.714136 * cr) * scale).clamp(0.0, 255.0) as u8,
                        ((y + 1.772 * cb) * scale).clamp(0.0, 255.0) as u8,
                    ]
                };
                rgb.extend_from_slice(&pixel);
            }
        }
        rgb
    }

    /// One sample; 10/12-bit planes are stored as u16.
    #[inline]
    fn sample(&self, ptr: *const u8, stride: isize, x: u32, y: u32) -> f32 {
        if self.bpc <= 8 {
            (unsafe { *ptr.offset(y as isize * stride + x as isize) }) as f32
        } else {
            let offset = y as isize * stride + x as isize * 2;
            (unsafe { (ptr.offset(offset) as *const u16).read_unaligned() }) as f32
        }
    }
}
