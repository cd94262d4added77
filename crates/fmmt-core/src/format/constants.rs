//! PI firmware file system constants.

use uuid::Uuid;

// Firmware volume header
pub const FVH_SIGNATURE: u32 = 0x4856465F; // '_FVH'
pub const FV_SIGNATURE_OFFSET: usize = 0x28;
pub const FV_HEADER_SIZE: usize = 0x38;
pub const FV_BLOCK_MAP_ENTRY_SIZE: usize = 8;
pub const FV_EXT_HEADER_SIZE: usize = 20;
pub const FVB2_ERASE_POLARITY: u32 = 0x0000_0800;
pub const FFS_REVISION: u8 = 2;

// Firmware file header
pub const FFS_FILE_HEADER_SIZE: usize = 24;
pub const FFS_FILE_HEADER2_SIZE: usize = 32;
pub const MAX_FFS_SIZE: usize = 0x00FF_FFFF;
pub const FFS_FIXED_CHECKSUM: u8 = 0xAA;
pub const FFS_FILE_ALIGNMENT: usize = 8;

// Section header
pub const SECTION_HEADER_SIZE: usize = 4;
pub const SECTION_HEADER2_SIZE: usize = 8;
pub const MAX_SECTION_SIZE: usize = 0x00FF_FFFF;
pub const SECTION_ALIGNMENT: usize = 4;
pub const COMPRESSION_HEADER_SIZE: usize = 5;
pub const GUID_DEFINED_HEADER_SIZE: usize = 20;

// Platform-init firmware (FSP) information header
pub const FSP_INFO_SIGNATURE: &[u8; 4] = b"FSPH";
pub const FSP_INFO_IMAGE_SIZE_OFFSET: usize = 0x18;
pub const FSP_INFO_IMAGE_BASE_OFFSET: usize = 0x1C;
pub const FSP_INFO_MIN_SIZE: usize = 0x20;

pub const FOUR_GIB: u64 = 0x1_0000_0000;

/// EFI_FFS_FILE_ATTRIBUTES bits.
pub mod attributes {
    pub const LARGE_FILE: u8 = 0x01;
    pub const DATA_ALIGNMENT_2: u8 = 0x02;
    pub const FIXED: u8 = 0x04;
    pub const DATA_ALIGNMENT: u8 = 0x38;
    pub const CHECKSUM: u8 = 0x40;
}

/// EFI_FFS_FILE_STATE bits (erase polarity 0 encoding).
pub mod state {
    pub const HEADER_CONSTRUCTION: u8 = 0x01;
    pub const HEADER_VALID: u8 = 0x02;
    pub const DATA_VALID: u8 = 0x04;
    pub const MARKED_FOR_UPDATE: u8 = 0x08;
    pub const DELETED: u8 = 0x10;
    pub const HEADER_INVALID: u8 = 0x20;
}

pub mod file_type {
    pub const RAW: u8 = 0x01;
    pub const FREEFORM: u8 = 0x02;
    pub const SECURITY_CORE: u8 = 0x03;
    pub const PEI_CORE: u8 = 0x04;
    pub const DXE_CORE: u8 = 0x05;
    pub const PEIM: u8 = 0x06;
    pub const DRIVER: u8 = 0x07;
    pub const COMBINED_PEIM_DRIVER: u8 = 0x08;
    pub const APPLICATION: u8 = 0x09;
    pub const MM: u8 = 0x0A;
    pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
    pub const COMBINED_MM_DXE: u8 = 0x0C;
    pub const MM_CORE: u8 = 0x0D;
    pub const MM_STANDALONE: u8 = 0x0E;
    pub const MM_CORE_STANDALONE: u8 = 0x0F;
    pub const FFS_PAD: u8 = 0xF0;
}

pub mod section_type {
    pub const COMPRESSION: u8 = 0x01;
    pub const GUID_DEFINED: u8 = 0x02;
    pub const DISPOSABLE: u8 = 0x03;
    pub const PE32: u8 = 0x10;
    pub const PIC: u8 = 0x11;
    pub const TE: u8 = 0x12;
    pub const DXE_DEPEX: u8 = 0x13;
    pub const VERSION: u8 = 0x14;
    pub const USER_INTERFACE: u8 = 0x15;
    pub const COMPATIBILITY16: u8 = 0x16;
    pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
    pub const FREEFORM_SUBTYPE_GUID: u8 = 0x18;
    pub const RAW: u8 = 0x19;
    pub const PEI_DEPEX: u8 = 0x1B;
    pub const MM_DEPEX: u8 = 0x1C;
}

pub mod compression {
    pub const NOT_COMPRESSED: u8 = 0x00;
    pub const STANDARD_COMPRESSION: u8 = 0x01;
}

/// EFI_GUIDED_SECTION_* attribute bits.
pub mod guided {
    pub const PROCESSING_REQUIRED: u16 = 0x01;
    pub const AUTH_STATUS_VALID: u16 = 0x02;
}

pub mod guid {
    use super::Uuid;

    pub const FIRMWARE_FILE_SYSTEM2: Uuid = Uuid::from_u128(0x8c8ce578_8a3d_4f1c_9935_896185c32dd3);
    pub const FIRMWARE_FILE_SYSTEM3: Uuid = Uuid::from_u128(0x5473c07a_3dcb_4dca_bd6f_1e9689e7349a);
    /// Volume top file; marks a volume that ends at the 4 GiB boundary.
    pub const VOLUME_TOP_FILE: Uuid = Uuid::from_u128(0x1ba0062e_c779_4582_8566_336ae8f78f09);
    /// FSP information header file.
    pub const FSP_INFO_FILE: Uuid = Uuid::from_u128(0x912740be_2284_4734_b971_84b027353f0c);

    pub const LZMA_CUSTOM_DECOMPRESS: Uuid = Uuid::from_u128(0xee4e5898_3914_4259_9d6e_dc7bd79403cf);
    pub const LZMA_F86_CUSTOM_DECOMPRESS: Uuid = Uuid::from_u128(0xd42ae6bd_1352_4bfb_909a_ca72a6eae889);
    pub const TIANO_CUSTOM_DECOMPRESS: Uuid = Uuid::from_u128(0xa31280ad_481e_41b6_95e8_127f4c984779);
    pub const BROTLI_CUSTOM_DECOMPRESS: Uuid = Uuid::from_u128(0x3d532050_5cda_4fd0_879e_0f7f630d5afb);
    pub const CRC32_GUIDED_SECTION: Uuid = Uuid::from_u128(0xfc1bcdb0_7d31_49aa_936a_a4600d9dd083);
}
