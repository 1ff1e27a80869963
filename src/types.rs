//! Phantom value types
//!
//! Registers, addresses and instruction words are all plain integers on the
//! machine. Wrapping each in its own newtype keeps them from being mixed up while
//! still allowing the arithmetic and bitwise operators the VM needs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{
    Add, AddAssign, BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Div, Mul,
    Not, Rem, Shl, Shr, Sub, SubAssign,
};

/// Defines a transparent integer newtype with the operator set shared by all
/// phantom values. `+`, `-` and `*` wrap; `/` and `%` follow the integer type.
macro_rules! phantom_value {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// The wrapped integer
            pub const fn value(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0.wrapping_add(rhs.0))
            }
        }

        impl Add<$inner> for $name {
            type Output = Self;
            fn add(self, rhs: $inner) -> Self {
                Self(self.0.wrapping_add(rhs))
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                self.0 = self.0.wrapping_add(rhs.0);
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0.wrapping_sub(rhs.0))
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                self.0 = self.0.wrapping_sub(rhs.0);
            }
        }

        impl Mul for $name {
            type Output = Self;
            fn mul(self, rhs: Self) -> Self {
                Self(self.0.wrapping_mul(rhs.0))
            }
        }

        impl Div for $name {
            type Output = Self;
            fn div(self, rhs: Self) -> Self {
                Self(self.0 / rhs.0)
            }
        }

        impl Rem for $name {
            type Output = Self;
            fn rem(self, rhs: Self) -> Self {
                Self(self.0 % rhs.0)
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl BitAnd<$inner> for $name {
            type Output = Self;
            fn bitand(self, rhs: $inner) -> Self {
                Self(self.0 & rhs)
            }
        }

        impl BitAndAssign for $name {
            fn bitand_assign(&mut self, rhs: Self) {
                self.0 &= rhs.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOr<$inner> for $name {
            type Output = Self;
            fn bitor(self, rhs: $inner) -> Self {
                Self(self.0 | rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitXor for $name {
            type Output = Self;
            fn bitxor(self, rhs: Self) -> Self {
                Self(self.0 ^ rhs.0)
            }
        }

        impl BitXorAssign for $name {
            fn bitxor_assign(&mut self, rhs: Self) {
                self.0 ^= rhs.0;
            }
        }

        impl Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self(!self.0)
            }
        }

        impl Shl<u32> for $name {
            type Output = Self;
            fn shl(self, rhs: u32) -> Self {
                Self(self.0.checked_shl(rhs).unwrap_or(0))
            }
        }

        impl Shr<u32> for $name {
            type Output = Self;
            fn shr(self, rhs: u32) -> Self {
                Self(self.0.checked_shr(rhs).unwrap_or(0))
            }
        }
    };
}

phantom_value!(
    /// One 64-bit register slot. The same bits are read as an integer or as an
    /// IEEE-754 double depending on the instruction.
    Register(u64)
);

phantom_value!(
    /// A 64-bit VM address. Bit 63 selects the static data space.
    Address(u64)
);

phantom_value!(
    /// One 16-bit instruction word.
    OneStep(u16)
);

/// Bit 63 of an [`Address`]: set for static data, clear for dynamic memory.
pub const STATIC_BIT: u64 = 1 << 63;

/// The address space an [`Address`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Mutable, write-on-demand working memory
    Dynamic,
    /// Immutable data preloaded from the object file
    Static,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Dynamic => write!(f, "dynamic"),
            AddressSpace::Static => write!(f, "static"),
        }
    }
}

impl Register {
    /// Reinterprets the 64 bits as an IEEE-754 binary64 value.
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Stores the bit pattern of an IEEE-754 binary64 value.
    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    /// Two's-complement view used by the signed branch tests.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<Register> for Address {
    fn from(register: Register) -> Self {
        Address(register.0)
    }
}

impl Address {
    /// Builds an address into the static data space.
    pub const fn static_data(offset: u64) -> Self {
        Address(offset | STATIC_BIT)
    }

    /// Builds an address into dynamic memory.
    pub const fn dynamic(offset: u64) -> Self {
        Address(offset & !STATIC_BIT)
    }

    pub fn space(self) -> AddressSpace {
        if self.0 & STATIC_BIT == 0 {
            AddressSpace::Dynamic
        } else {
            AddressSpace::Static
        }
    }

    /// The low 63 bits
    pub fn offset(self) -> u64 {
        self.0 & !STATIC_BIT
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space() {
            AddressSpace::Dynamic => write!(f, "@{}", self.0),
            AddressSpace::Static => write!(f, "@static:{}", self.offset()),
        }
    }
}

impl fmt::Display for OneStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}
