//! Overflow pages: items too large to store inline.

use crate::block::BlockManager;
use crate::body::PageBody;
use crate::codec::{self, PageGeometry};
use crate::item::{Item, ItemType, OvflRef};
use crate::page::{PageHeader, PageType, LEVEL_NONE};
use bytes::Bytes;
use cambium_common::{CambiumError, Result};

/// Writes `payload` to a standalone overflow page.
pub fn write_overflow(
    blocks: &dyn BlockManager,
    geometry: &PageGeometry,
    payload: &[u8],
) -> Result<OvflRef> {
    let header = PageHeader::new(PageType::Ovfl, LEVEL_NONE);
    let image = codec::encode(&header, &PageBody::Raw(Bytes::copy_from_slice(payload)), geometry)?;
    let (addr, size) = blocks.write(&image)?;
    tracing::trace!(%addr, size, len = payload.len(), "wrote overflow page");
    Ok(OvflRef::new(addr, size))
}

/// Builds an item of type `kind`, spilling the payload to an overflow page
/// when it is longer than `threshold`.
///
/// Types without an overflow form are always stored inline.
pub fn spill(
    blocks: &dyn BlockManager,
    geometry: &PageGeometry,
    kind: ItemType,
    payload: Bytes,
    threshold: u32,
) -> Result<Item> {
    match kind.overflow_form() {
        Some(ovfl_kind) if payload.len() > threshold as usize => {
            let ovfl = write_overflow(blocks, geometry, &payload)?;
            Ok(Item::overflow(ovfl_kind, ovfl))
        }
        _ => Ok(Item::new(kind, payload)),
    }
}

/// Reads and verifies the overflow page `ovfl` points at.
pub fn read_overflow(
    blocks: &dyn BlockManager,
    geometry: &PageGeometry,
    ovfl: OvflRef,
) -> Result<Bytes> {
    let image = blocks.read(ovfl.addr, ovfl.size)?;
    let page = codec::decode(image, geometry, ovfl.addr)?;
    match page.body {
        PageBody::Raw(data) if page.header.page_type == PageType::Ovfl => Ok(data),
        _ => Err(CambiumError::corruption(
            ovfl.addr.0,
            format!("expected an overflow page, found {:?}", page.header.page_type),
        )),
    }
}

/// Returns an item's payload, following overflow references.
pub fn resolve(blocks: &dyn BlockManager, geometry: &PageGeometry, item: &Item) -> Result<Bytes> {
    match item.as_ovfl() {
        Some(ovfl) => read_overflow(blocks, geometry, ovfl),
        None => Ok(item.payload.clone()),
    }
}

/// Frees the overflow page an item points at, if any.
pub fn free_overflow(blocks: &dyn BlockManager, item: &Item) -> Result<()> {
    if let Some(ovfl) = item.as_ovfl() {
        blocks.free(ovfl.addr, ovfl.size)?;
    }
    Ok(())
}
