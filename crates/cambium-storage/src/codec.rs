//! Whole-page encode and decode.
//!
//! An encoded page is the 28-byte header, the body, and zero padding up to a
//! whole number of allocation units. The checksum covers the entire image
//! with the checksum field itself read as zero.

use crate::body::PageBody;
use crate::page::PageHeader;
use bytes::{BufMut, Bytes, BytesMut};
use cambium_common::{Address, AllocationUnit, BtreeConfig, CambiumError, Result, PAGE_SIZE_MAX};

/// Geometry needed to encode and decode pages of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub unit: AllocationUnit,
    /// Largest image accepted in either direction.
    pub max_page_size: u32,
    /// Record length of fixed-length column pages (0 if unused).
    pub fixed_len: u8,
}

impl PageGeometry {
    pub fn new(unit: AllocationUnit) -> Self {
        Self {
            unit,
            max_page_size: PAGE_SIZE_MAX,
            fixed_len: 0,
        }
    }

    pub fn with_fixed_len(mut self, fixed_len: u8) -> Self {
        self.fixed_len = fixed_len;
        self
    }

    pub fn with_max_page_size(mut self, max: u32) -> Self {
        self.max_page_size = max;
        self
    }

    /// Geometry of a tree with the given configuration.
    pub fn from_config(config: &BtreeConfig) -> Result<Self> {
        Ok(Self {
            unit: config.allocation_unit()?,
            max_page_size: config.page_size_max,
            fixed_len: config.fixed_len,
        })
    }
}

/// A decoded page: header, typed body and the image the body views into.
#[derive(Debug, Clone)]
pub struct DiskPage {
    pub header: PageHeader,
    pub body: PageBody,
    image: Bytes,
}

impl DiskPage {
    /// The full on-disk image.
    pub fn image(&self) -> &Bytes {
        &self.image
    }

    /// Image length in bytes.
    pub fn size(&self) -> u32 {
        self.image.len() as u32
    }
}

/// Computes the checksum of a page image, reading the checksum field as zero.
pub fn page_checksum(image: &[u8]) -> u32 {
    let at = PageHeader::CHECKSUM_OFFSET;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[..at]);
    hasher.update(&[0u8; 4]);
    hasher.update(&image[at + 4..]);
    hasher.finalize()
}

/// Serializes a page.
///
/// The header's `entries` and `checksum` fields are filled in from the body
/// and the image; the other header fields are written as given.
pub fn encode(header: &PageHeader, body: &PageBody, geometry: &PageGeometry) -> Result<Bytes> {
    body.validate(header.page_type, geometry.fixed_len)?;

    let body_len = body.encoded_len(geometry.fixed_len);
    let total = geometry.unit.bytes_to_alloc(body_len, PageHeader::SIZE);
    if total > geometry.max_page_size as usize {
        return Err(CambiumError::Size {
            what: "page",
            size: total,
            max: geometry.max_page_size as usize,
        });
    }

    let mut header = *header;
    header.entries = body.entries() as u32;
    header.checksum = 0;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&header.to_bytes());
    body.write_to(&mut buf)?;
    debug_assert_eq!(buf.len(), PageHeader::SIZE + body_len);
    buf.resize(total, 0);

    let checksum = page_checksum(&buf);
    let at = PageHeader::CHECKSUM_OFFSET;
    buf[at..at + 4].copy_from_slice(&checksum.to_le_bytes());
    Ok(buf.freeze())
}

/// Deserializes and verifies a page image read from `addr`.
pub fn decode(image: Bytes, geometry: &PageGeometry, addr: Address) -> Result<DiskPage> {
    let unit = geometry.unit.size() as usize;
    if image.is_empty() || image.len() % unit != 0 {
        return Err(CambiumError::corruption(
            addr.0,
            format!(
                "page length {} is not a multiple of the allocation unit {}",
                image.len(),
                unit
            ),
        ));
    }
    if image.len() > geometry.max_page_size as usize {
        return Err(CambiumError::corruption(
            addr.0,
            format!(
                "page length {} exceeds the maximum page size {}",
                image.len(),
                geometry.max_page_size
            ),
        ));
    }

    let at = PageHeader::CHECKSUM_OFFSET;
    let stored = u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]);
    let computed = page_checksum(&image);
    if stored != computed {
        tracing::warn!(%addr, stored, computed, "page checksum mismatch");
        return Err(CambiumError::corruption(
            addr.0,
            format!("checksum mismatch: stored {:#010x}, computed {:#010x}", stored, computed),
        ));
    }

    let header = PageHeader::from_bytes(&image)
        .ok_or_else(|| CambiumError::corruption(addr.0, format!("unknown page type {}", image[24])))?;
    let body = PageBody::parse(&header, &image, geometry.fixed_len, addr)?;
    Ok(DiskPage {
        header,
        body,
        image,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RleRun;
    use crate::item::{Item, ItemType, OffRecord, OffRef, OvflRef};
    use crate::page::{PageType, LEVEL_LEAF, LEVEL_NONE};
    use cambium_common::Lsn;
    use rand::{Rng, SeedableRng};

    fn geometry() -> PageGeometry {
        PageGeometry::new(AllocationUnit::new(512).unwrap())
    }

    fn apple_banana() -> PageBody {
        PageBody::Items(vec![
            Item::key(Bytes::from_static(b"apple")),
            Item::data(Bytes::from_static(b"red")),
            Item::key(Bytes::from_static(b"banana")),
            Item::data(Bytes::from_static(b"yellow")),
        ])
    }

    #[test]
    fn test_row_leaf_scenario() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF).with_start_recno(0);
        let image = encode(&header, &apple_banana(), &geometry()).unwrap();
        assert_eq!(image.len(), 512);

        let page = decode(image.clone(), &geometry(), Address(1)).unwrap();
        assert_eq!(page.header.page_type, PageType::RowLeaf);
        assert_eq!(page.header.entries, 4);
        assert_eq!(page.header.level, 1);
        assert_eq!(page.header.start_recno, 0);
        assert_eq!(page.body, apple_banana());

        let mut zeroed = image.to_vec();
        zeroed[16..20].fill(0);
        assert_eq!(crc32fast::hash(&zeroed), page.header.checksum);
        assert_eq!(&image[16..20], &page.header.checksum.to_le_bytes());
    }

    #[test]
    fn test_round_trip_every_page_type() {
        let geo = geometry().with_fixed_len(4);
        let cases = vec![
            (PageType::RowLeaf, LEVEL_LEAF, apple_banana()),
            (
                PageType::RowLeaf,
                LEVEL_LEAF,
                PageBody::Items(vec![
                    Item::key(Bytes::new()),
                    Item::new(ItemType::DataDup, Bytes::from_static(b"d1")),
                    Item::new(ItemType::DataDup, Bytes::from_static(b"d2")),
                    Item::overflow(ItemType::KeyOvfl, OvflRef::new(Address(40), 8192)),
                    Item::off_record(OffRecord::new(Address(41), 512, 12)),
                ]),
            ),
            (
                PageType::RowInt,
                2,
                PageBody::Items(vec![
                    Item::key(Bytes::new()),
                    Item::off(OffRef::new(Address(3), 512)),
                    Item::key(Bytes::from_static(b"m")),
                    Item::off(OffRef::new(Address(4), 1024)),
                ]),
            ),
            (
                PageType::DupInt,
                2,
                PageBody::Items(vec![
                    Item::new(ItemType::KeyDup, Bytes::from_static(b"a")),
                    Item::off(OffRef::new(Address(5), 512)),
                ]),
            ),
            (
                PageType::DupLeaf,
                LEVEL_LEAF,
                PageBody::Items(vec![Item::new(ItemType::DataDup, Bytes::from_static(b"x"))]),
            ),
            (
                PageType::ColVar,
                LEVEL_LEAF,
                PageBody::Items(vec![
                    Item::data(Bytes::from_static(b"one")),
                    Item::deleted(),
                    Item::overflow(ItemType::DataOvfl, OvflRef::new(Address(9), 1536)),
                ]),
            ),
            (
                PageType::ColFix,
                LEVEL_LEAF,
                PageBody::Fixed(vec![
                    Bytes::from_static(b"aaaa"),
                    Bytes::from_static(b"\x80\0\0\0"),
                ]),
            ),
            (
                PageType::ColRle,
                LEVEL_LEAF,
                PageBody::Runs(vec![RleRun::new(10, Bytes::from_static(b"VVVV"))]),
            ),
            (
                PageType::ColInt,
                2,
                PageBody::Children(vec![
                    OffRecord::new(Address(1), 512, 100),
                    OffRecord::new(Address(2), 1024, 7),
                ]),
            ),
            (
                PageType::Freelist,
                LEVEL_NONE,
                PageBody::Extents(vec![OffRef::new(Address(12), 1024)]),
            ),
            (
                PageType::Ovfl,
                LEVEL_NONE,
                PageBody::Raw(Bytes::from(vec![0xabu8; 700])),
            ),
        ];

        for (page_type, level, body) in cases {
            let header = PageHeader::new(page_type, level)
                .with_start_recno(100)
                .with_lsn(Lsn::new(2, 4096));
            let image = encode(&header, &body, &geo).unwrap();
            assert_eq!(image.len() % 512, 0);
            let page = decode(image, &geo, Address(7)).unwrap();
            assert_eq!(page.header.page_type, page_type);
            assert_eq!(page.header.level, level);
            assert_eq!(page.header.start_recno, 100);
            assert_eq!(page.header.lsn, Lsn::new(2, 4096));
            assert_eq!(page.header.entries as usize, body.entries());
            assert_eq!(page.body, body, "{:?}", page_type);
        }
    }

    #[test]
    fn test_every_single_byte_flip_is_detected() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
        let image = encode(&header, &apple_banana(), &geometry()).unwrap();
        for i in 0..image.len() {
            let mut bad = image.to_vec();
            bad[i] ^= 0x01;
            let err = decode(Bytes::from(bad), &geometry(), Address(3)).unwrap_err();
            assert!(
                matches!(err, CambiumError::Corruption { addr: 3, .. }),
                "byte {} flip not detected",
                i
            );
        }
    }

    #[test]
    fn test_random_byte_flips_are_detected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let geo = geometry().with_fixed_len(8);
        let header = PageHeader::new(PageType::ColFix, LEVEL_LEAF).with_start_recno(1);
        let records: Vec<Bytes> = (0..200u64).map(|i| Bytes::from(i.to_le_bytes().to_vec())).collect();
        let image = encode(&header, &PageBody::Fixed(records), &geo).unwrap();
        for _ in 0..500 {
            let mut bad = image.to_vec();
            let at = rng.random_range(0..bad.len());
            let flip: u8 = rng.random_range(1..=255);
            bad[at] ^= flip;
            assert!(decode(Bytes::from(bad), &geo, Address(1)).is_err());
        }
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let geo = geometry();
        assert!(matches!(
            decode(Bytes::new(), &geo, Address(1)),
            Err(CambiumError::Corruption { .. })
        ));
        assert!(matches!(
            decode(Bytes::from(vec![0u8; 700]), &geo, Address(1)),
            Err(CambiumError::Corruption { .. })
        ));

        let header = PageHeader::new(PageType::Ovfl, LEVEL_NONE);
        let body = PageBody::Raw(Bytes::from(vec![1u8; 1024 - PageHeader::SIZE]));
        let image = encode(&header, &body, &geo).unwrap();
        assert_eq!(image.len(), 1024);
        let small = geo.with_max_page_size(512);
        assert!(matches!(
            decode(image, &small, Address(1)),
            Err(CambiumError::Corruption { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_page() {
        let geo = geometry().with_max_page_size(512);
        let header = PageHeader::new(PageType::Ovfl, LEVEL_NONE);
        let err = encode(&header, &PageBody::Raw(Bytes::from(vec![0u8; 485])), &geo).unwrap_err();
        assert!(matches!(err, CambiumError::Size { what: "page", .. }));
        assert!(encode(&header, &PageBody::Raw(Bytes::from(vec![0u8; 484])), &geo).is_ok());
    }

    #[test]
    fn test_encode_rejects_oversized_item() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
        let body = PageBody::Items(vec![
            Item::key(Bytes::from_static(b"k")),
            Item::data(Bytes::from(vec![0u8; crate::item::ITEM_MAX_LEN + 1])),
        ]);
        let err = encode(&header, &body, &geometry()).unwrap_err();
        assert!(matches!(err, CambiumError::Size { .. }));
    }

    #[test]
    fn test_empty_items_round_trip() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
        let body = PageBody::Items(vec![Item::key(Bytes::new()), Item::data(Bytes::new())]);
        let image = encode(&header, &body, &geometry()).unwrap();
        let page = decode(image, &geometry(), Address(1)).unwrap();
        assert_eq!(page.body, body);
    }

    #[test]
    fn test_empty_page_round_trip() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
        let image = encode(&header, &PageBody::Items(Vec::new()), &geometry()).unwrap();
        assert_eq!(image.len(), 512);
        let page = decode(image, &geometry(), Address(1)).unwrap();
        assert_eq!(page.header.entries, 0);
        assert_eq!(page.body, PageBody::Items(Vec::new()));
    }

    #[test]
    fn test_decoded_payloads_view_the_image() {
        let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
        let image = encode(&header, &apple_banana(), &geometry()).unwrap();
        let base = image.as_ptr() as usize;
        let page = decode(image, &geometry(), Address(1)).unwrap();
        let PageBody::Items(items) = &page.body else {
            panic!("expected items");
        };
        let p = items[0].payload.as_ptr() as usize;
        assert!(p >= base && p < base + 512);
        assert_eq!(page.size(), 512);
    }

    #[test]
    fn test_decode_requires_fixed_len() {
        let geo = geometry().with_fixed_len(2);
        let header = PageHeader::new(PageType::ColFix, LEVEL_LEAF);
        let image = encode(&header, &PageBody::Fixed(vec![Bytes::from_static(b"ab")]), &geo).unwrap();
        let err = decode(image, &geometry(), Address(1)).unwrap_err();
        assert!(matches!(err, CambiumError::Format(_)));
    }
}
