use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One chunk of input for the process, or the end of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "Data", default)]
    pub data: Vec<u8>,
    #[serde(rename = "EOF", default)]
    pub eof: bool,
}

impl Input {
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Input {
            data: data.into(),
            eof: false,
        }
    }

    pub fn eof() -> Self {
        Input {
            data: Vec::new(),
            eof: true,
        }
    }
}

pub fn write_frame<W: Write>(mut out: W, input: &Input) -> serde_json::Result<()> {
    serde_json::to_writer(&mut out, input)?;
    out.flush().map_err(serde_json::Error::io)
}

/// Decode frames until the stream ends or stops making sense.
pub fn read_frames<R: Read>(input: R) -> impl Iterator<Item = serde_json::Result<Input>> {
    serde_json::Deserializer::from_reader(input).into_iter::<Input>()
}
