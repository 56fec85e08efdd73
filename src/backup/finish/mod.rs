use flate2::write::DeflateEncoder;
use std::io::{Error, Write};

/// Flushes trailing state of a stream writer and hands back the inner writer.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for DeflateEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use flate2::Compression;
    use std::io::Read;

    #[test]
    fn test_deflate_finish_writes_trailer() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello hello hello").unwrap();
        let packed = Finish::finish(encoder).unwrap();

        let mut out = String::new();
        DeflateDecoder::new(packed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello hello hello");
    }
}
