// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Multi-algorithm digesting.

Signatures frequently carry several code directories, one per digest
algorithm. Validating them means hashing the same bytes with each algorithm.
[MultiDigester] feeds data to a set of hashers at once so a file or a page
only has to be read a single time.

[digest_pages] splits a byte range into pages the way code directories do
and hands every page's digests to a callback. A page size of `None` means the
entire range is one page.
*/

use {
    crate::{
        embedded_signature::DigestType,
        error::{CodeValidationError, Result},
    },
    std::{
        collections::BTreeMap,
        io::{Read, Seek, SeekFrom},
    },
};

const READ_BUFFER_SIZE: usize = 16384;

/// Digests of one piece of data keyed by algorithm.
pub type DigestSet = BTreeMap<DigestType, Vec<u8>>;

/// Computes digests with several algorithms in one pass.
#[derive(Clone)]
pub struct MultiDigester {
    hashers: Vec<(DigestType, ring::digest::Context)>,
}

impl MultiDigester {
    /// Construct an instance hashing with every given algorithm.
    ///
    /// Duplicate algorithms are collapsed. Unsupported algorithms are an
    /// error.
    pub fn new(types: impl IntoIterator<Item = DigestType>) -> Result<Self> {
        let mut hashers: Vec<(DigestType, ring::digest::Context)> = vec![];

        for digest_type in types {
            if hashers.iter().any(|(t, _)| *t == digest_type) {
                continue;
            }

            hashers.push((digest_type, digest_type.as_hasher()?));
        }

        Ok(Self { hashers })
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in self.hashers.iter_mut() {
            hasher.update(data);
        }
    }

    pub fn finish(self) -> DigestSet {
        self.hashers
            .into_iter()
            .map(|(digest_type, hasher)| (digest_type, digest_type.finish(hasher)))
            .collect()
    }

    /// Feed the remainder of a reader.
    ///
    /// Returns the number of bytes consumed.
    pub fn update_from_reader(&mut self, reader: &mut impl Read) -> Result<u64> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut total = 0;

        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }

            self.update(&buffer[0..count]);
            total += count as u64;
        }

        Ok(total)
    }
}

/// Digest a byte range of a seekable reader, one page at a time.
///
/// `on_page` receives the page index and the digests of that page. The final
/// page may be short. Returns the number of pages digested. Reading stops
/// early with an I/O error if the reader ends before `offset + length`.
pub fn digest_pages<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    length: u64,
    page_size: Option<u64>,
    types: &[DigestType],
    mut on_page: impl FnMut(usize, &DigestSet) -> Result<()>,
) -> Result<usize> {
    reader.seek(SeekFrom::Start(offset))?;

    let page_size = match page_size {
        Some(0) => {
            return Err(CodeValidationError::Internal("zero page size".into()));
        }
        Some(size) => size,
        None => length.max(1),
    };

    let template = MultiDigester::new(types.iter().copied())?;
    let mut remaining = length;
    let mut page = 0;
    let mut buffer = vec![0u8; page_size.min(1 << 20) as usize];

    while remaining > 0 {
        let mut digester = template.clone();
        let mut page_remaining = remaining.min(page_size);
        remaining -= page_remaining;

        while page_remaining > 0 {
            let want = page_remaining.min(buffer.len() as u64) as usize;
            reader.read_exact(&mut buffer[0..want])?;
            digester.update(&buffer[0..want]);
            page_remaining -= want as u64;
        }

        on_page(page, &digester.finish())?;
        page += 1;
    }

    Ok(page)
}

/// Choose the strongest algorithm we trust among `types`.
///
/// The preference order is sha384, sha256, truncated sha256, sha1. Other
/// algorithms are never chosen.
pub fn best_hash_of(types: impl IntoIterator<Item = DigestType>) -> Option<DigestType> {
    types
        .into_iter()
        .filter_map(|t| t.preference_rank().map(|rank| (rank, t)))
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, t)| t)
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Cursor};

    #[test]
    fn multi_digester_matches_single() {
        let mut digester =
            MultiDigester::new([DigestType::Sha1, DigestType::Sha256, DigestType::Sha1]).unwrap();
        digester.update(b"hello ");
        digester.update(b"world");

        let digests = digester.finish();
        assert_eq!(digests.len(), 2);
        assert_eq!(
            digests[&DigestType::Sha256],
            DigestType::Sha256.digest_data(b"hello world").unwrap()
        );
        assert_eq!(
            digests[&DigestType::Sha1],
            DigestType::Sha1.digest_data(b"hello world").unwrap()
        );
    }

    #[test]
    fn pages() {
        let data = (0..10000u32).map(|x| x as u8).collect::<Vec<_>>();
        let mut seen = vec![];

        let count = digest_pages(
            &mut Cursor::new(&data),
            0,
            data.len() as u64,
            Some(4096),
            &[DigestType::Sha256],
            |page, digests| {
                seen.push((page, digests[&DigestType::Sha256].clone()));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            seen[2].1,
            DigestType::Sha256.digest_data(&data[8192..]).unwrap()
        );

        let count = digest_pages(
            &mut Cursor::new(&data),
            0,
            data.len() as u64,
            None,
            &[DigestType::Sha1],
            |_, digests| {
                assert_eq!(
                    digests[&DigestType::Sha1],
                    DigestType::Sha1.digest_data(&data).unwrap()
                );
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn short_reader_fails() {
        let data = vec![0u8; 100];

        assert!(digest_pages(
            &mut Cursor::new(&data),
            0,
            200,
            Some(64),
            &[DigestType::Sha256],
            |_, _| Ok(())
        )
        .is_err());
    }

    #[test]
    fn best_hash_preference() {
        assert_eq!(
            best_hash_of([DigestType::Sha1, DigestType::Sha256]),
            Some(DigestType::Sha256)
        );
        assert_eq!(
            best_hash_of([DigestType::Sha256Truncated, DigestType::Sha384, DigestType::Sha1]),
            Some(DigestType::Sha384)
        );
        assert_eq!(best_hash_of([DigestType::Sha512]), None);
        assert_eq!(best_hash_of(std::iter::empty()), None);
    }
}
