//! Kernel symbol table.
//!
//! Parses the `nm`-style map shipped in the initial ramdisk
//! (`hex-address [type] name` per line) into an address-sorted table; the
//! panic backtrace resolves return addresses against it.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

/// A resolved address: the nearest preceding symbol and the offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub name: &'a str,
    pub address: usize,
    pub offset: usize,
}

/// Address-sorted symbol table.
#[derive(Debug)]
pub struct SymbolTable {
    /// `(address, name)`, ascending by address.
    symbols: Vec<(usize, String)>,
}

impl SymbolTable {
    /// Parse map text. Blank lines are skipped; a line is
    /// `address [type-token] name` with the address in hex.
    pub fn parse(text: &str) -> KernelResult<Self> {
        let mut symbols: Vec<(usize, String)> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let address_field = fields.next().ok_or(KernelError::BadSymbolTable {
                line: index + 1,
            })?;
            let address = usize::from_str_radix(address_field, 16)
                .map_err(|_| KernelError::BadSymbolTable { line: index + 1 })?;
            let mut name = fields.next().ok_or(KernelError::BadSymbolTable {
                line: index + 1,
            })?;
            if name.len() == 1 {
                // `nm` emits a one-character type column before the name.
                name = fields.next().ok_or(KernelError::BadSymbolTable {
                    line: index + 1,
                })?;
            }
            symbols.push((address, String::from(name)));
        }
        symbols.sort_by_key(|&(address, _)| address);
        Ok(Self { symbols })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Nearest symbol at or below `address`.
    pub fn resolve(&self, address: usize) -> Option<Resolved<'_>> {
        let position = self
            .symbols
            .partition_point(|&(symbol_address, _)| symbol_address <= address);
        let (symbol_address, name) = self.symbols.get(position.checked_sub(1)?)?;
        Some(Resolved {
            name,
            address: *symbol_address,
            offset: address - symbol_address,
        })
    }
}

/// The kernel's own symbol table, loaded from the initrd during boot.
pub static SYMBOLS: GlobalState<SymbolTable> = GlobalState::new();

/// Parse and install the boot symbol map.
pub fn load(text: &str) -> KernelResult<()> {
    let table = SymbolTable::parse(text)?;
    log::info!("symbol table loaded: {} symbols", table.len());
    SYMBOLS
        .init(table)
        .map_err(|_| KernelError::InvalidArgument { name: "symbol table reinit" })
}

/// Resolve against the global table. `(name, offset)` of the nearest
/// preceding symbol.
pub fn resolve(address: usize) -> Option<(String, usize)> {
    SYMBOLS
        .with(|table| {
            table
                .resolve(address)
                .map(|hit| (String::from(hit.name), hit.offset))
        })
        .flatten()
}
