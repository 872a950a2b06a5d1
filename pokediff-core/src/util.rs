use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::DeviceMap;

/// Resolves a [`DeviceMap`] to a candle device.
///
/// An accelerator ordinal fails when neither CUDA nor Metal support was
/// compiled in; the caller has to ask for the CPU explicitly.
pub fn select_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(ordinal) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            let hint = "build with `--features metal`";
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            let hint = "build with `--features cuda`";
            anyhow::bail!("no accelerator available for device {ordinal}; {hint} or pass --cpu")
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn force_cpu_selects_cpu() {
        let device = select_device(DeviceMap::ForceCpu).unwrap();
        assert!(device.is_cpu());
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn ordinal_without_accelerator_is_an_error() {
        let err = select_device(DeviceMap::Ordinal(0)).unwrap_err();
        assert!(err.to_string().contains("no accelerator"), "{err}");
    }

    #[test]
    fn tensor_to_image_keeps_pixel_layout() {
        // channel-major: red plane, green plane, blue plane for a 2x1 image
        let data: Vec<u8> = vec![10, 20, 30, 40, 50, 60];
        let tensor = Tensor::from_vec(data, (3, 1, 2), &Device::Cpu).unwrap();
        let img = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [10, 30, 50]);
        assert_eq!(img.get_pixel(1, 0).0, [20, 40, 60]);
    }

    #[test]
    fn tensor_to_image_rejects_grayscale() {
        let tensor = Tensor::zeros((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
