// Frame unit wire format
//
//   b"FRU1" | run_id (u64 BE) | sequence_number (u64 BE) | PNG image
//
// PNG is lossless, so a decoded frame is pixel-identical to the published one.

use crate::error::FrameProcessingError;
use crate::pipeline::types::FrameUnit;
use opencv::core::Vector;
use opencv::imgcodecs;
use opencv::prelude::*;

const MAGIC: &[u8; 4] = b"FRU1";
const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    pub run_id: u64,
    pub sequence_number: u64,
}

pub fn encode_unit(run_id: u64, unit: &FrameUnit) -> opencv::Result<Vec<u8>> {
    let png = encode_png(&unit.image)?;
    let mut payload = Vec::with_capacity(HEADER_LEN + png.len());
    payload.extend_from_slice(MAGIC);
    payload.extend_from_slice(&run_id.to_be_bytes());
    payload.extend_from_slice(&unit.sequence_number.to_be_bytes());
    payload.extend_from_slice(&png);
    Ok(payload)
}

pub fn decode_header(payload: &[u8]) -> Result<UnitHeader, FrameProcessingError> {
    if payload.len() < HEADER_LEN || &payload[..4] != MAGIC {
        return Err(FrameProcessingError::Payload(format!(
            "missing frame header ({} bytes)",
            payload.len()
        )));
    }
    let mut run_id = [0u8; 8];
    let mut sequence_number = [0u8; 8];
    run_id.copy_from_slice(&payload[4..12]);
    sequence_number.copy_from_slice(&payload[12..20]);
    Ok(UnitHeader {
        run_id: u64::from_be_bytes(run_id),
        sequence_number: u64::from_be_bytes(sequence_number),
    })
}

pub fn decode_unit(payload: &[u8]) -> Result<(UnitHeader, FrameUnit), FrameProcessingError> {
    let header = decode_header(payload)?;
    let image = decode_png(&payload[HEADER_LEN..]).map_err(|e| {
        FrameProcessingError::Payload(format!(
            "frame {} image unreadable: {}",
            header.sequence_number, e
        ))
    })?;
    if image.empty() || image.channels() != 3 {
        return Err(FrameProcessingError::Payload(format!(
            "frame {} is not a 3-channel image",
            header.sequence_number
        )));
    }
    Ok((
        header,
        FrameUnit {
            sequence_number: header.sequence_number,
            image,
        },
    ))
}

pub fn encode_png(image: &Mat) -> opencv::Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    if !imgcodecs::imencode(".png", image, &mut buf, &Vector::new())? {
        return Err(opencv::Error::new(
            opencv::core::StsError,
            "PNG encoder rejected the image",
        ));
    }
    Ok(buf.to_vec())
}

pub fn decode_png(bytes: &[u8]) -> opencv::Result<Mat> {
    let buf = Vector::<u8>::from_slice(bytes);
    imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Vec3b, CV_8UC3};

    #[test]
    fn test_payload_carries_run_and_sequence() {
        let image =
            Mat::new_rows_cols_with_default(12, 16, CV_8UC3, Scalar::new(10.0, 20.0, 30.0, 0.0))
                .unwrap();
        let unit = FrameUnit {
            sequence_number: 41,
            image,
        };
        let payload = encode_unit(7, &unit).unwrap();

        let (header, decoded) = decode_unit(&payload).unwrap();
        assert_eq!(
            header,
            UnitHeader {
                run_id: 7,
                sequence_number: 41
            }
        );
        assert_eq!(decoded.sequence_number, 41);
        assert_eq!((decoded.image.rows(), decoded.image.cols()), (12, 16));
        let px = decoded.image.at_2d::<Vec3b>(5, 5).unwrap();
        assert_eq!((px[0], px[1], px[2]), (10, 20, 30));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            decode_header(b"nope"),
            Err(FrameProcessingError::Payload(_))
        ));

        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(&3u64.to_be_bytes());
        payload.extend_from_slice(b"not a png");
        // Header is intact, so the sequence number is still recoverable
        assert_eq!(decode_header(&payload).unwrap().sequence_number, 3);
        assert!(decode_unit(&payload).is_err());
    }
}
