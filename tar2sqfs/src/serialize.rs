//! Serialization of the filesystem tree into the inode and directory
//! tables.
//!
//! Nodes are visited in inode order (children before their parent, root
//! last), so every directory entry can reference its target's inode
//! location, and the root reference lands in the superblock at the end.
use bstr::ByteSlice;
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use sqfs::compress::Compressor;
use sqfs::data::FileData;
use sqfs::dir::{DirWriter, Listing};
use sqfs::file::OutputFile;
use sqfs::format::{
    self, DevInode, DirInode, ExtDevInode, ExtDirInode, ExtFileInode, ExtIpcInode, FileInode,
    Flags, InodeHeader, InodeType, IpcInode, SuperBlock, SymlinkInode,
};
use sqfs::id_table::IdTable;
use sqfs::meta::MetaWriter;
use sqfs::table;

use crate::fstree::{FsTree, NodeId, Payload};

/// Emit every inode and directory listing, then append both metadata
/// streams to the image and point the superblock at them.
pub fn serialize_fstree(
    file: &mut OutputFile,
    sb: &mut SuperBlock,
    fs: &mut FsTree,
    files: &[FileData],
    cmp: &Compressor,
    idtbl: &mut IdTable,
) -> sqfs::Result<()> {
    let mut im = MetaWriter::new(cmp.clone());
    let mut dw = DirWriter::new(cmp.clone());

    for &id in &fs.inode_order().to_vec() {
        let listing = write_dir_entries(fs, &mut dw, id)?;
        let uid_idx = idtbl.id_to_index(fs.node(id).uid)?;
        let gid_idx = idtbl.id_to_index(fs.node(id).gid)?;

        let (block, offset) = im.get_position();
        write_inode(&mut im, fs, files, id, listing, uid_idx, gid_idx)?;
        fs.node_mut(id).inode_ref = format::inode_ref(block, offset);
    }

    sb.root_inode_ref = le::U64::new(fs.node(NodeId::ROOT).inode_ref);
    sb.inode_table_start = le::U64::new(file.get_size());
    file.append(&im.into_bytes()?)?;
    sb.directory_table_start = le::U64::new(file.get_size());
    file.append(&dw.into_bytes()?)?;
    Ok(())
}

/// The dense NFS lookup table: inode number to inode reference.
pub fn write_export_table(
    file: &mut OutputFile,
    sb: &mut SuperBlock,
    fs: &FsTree,
    cmp: &Compressor,
) -> sqfs::Result<()> {
    let refs = fs
        .inode_order()
        .iter()
        .map(|&id| le::U64::new(fs.node(id).inode_ref))
        .collect::<Vec<_>>();
    sb.export_table_start =
        le::U64::new(table::write_table(file, cmp, refs.as_slice().as_bytes())?);
    sb.set_flag(Flags::EXPORTABLE);
    Ok(())
}

fn write_dir_entries(
    fs: &FsTree,
    dw: &mut DirWriter,
    id: NodeId,
) -> sqfs::Result<Option<Listing>> {
    let Payload::Dir { children } = &fs.node(id).payload else {
        return Ok(None);
    };
    dw.begin();
    for &child in children {
        let c = fs.node(child);
        dw.add_entry(c.name.as_bstr(), c.inode_num, c.inode_ref, c.mode)?;
    }
    dw.end().map(Some)
}

fn write_inode(
    im: &mut MetaWriter,
    fs: &FsTree,
    files: &[FileData],
    id: NodeId,
    listing: Option<Listing>,
    uid_idx: u16,
    gid_idx: u16,
) -> sqfs::Result<()> {
    let node = fs.node(id);
    let has_xattr = node.xattr_idx != format::NO_XATTR;
    let basic_type =
        InodeType::basic_of_mode(node.mode).expect("tree nodes always carry a file type");

    let mut header = InodeHeader {
        inode_type: basic_type,
        mode: le::U16::new((node.mode & 0o7777) as u16),
        uid_idx: le::U16::new(uid_idx),
        gid_idx: le::U16::new(gid_idx),
        modification_time: le::U32::new(node.mtime),
        inode_number: le::U32::new(node.inode_num),
    };

    match &node.payload {
        Payload::Dir { .. } => {
            let listing = listing.expect("directories always produce a listing");
            let size = u64::from(listing.size) + 3;
            let parent_inode = node
                .parent
                .map_or(0, |parent| fs.node(parent).inode_num);

            if !has_xattr && size <= u64::from(u16::MAX) && listing.index.is_empty() {
                im.append(header.as_bytes())?;
                im.append(
                    DirInode {
                        block_index: le::U32::new(listing.block),
                        nlink: le::U32::new(node.link_count),
                        size: le::U16::new(size as u16),
                        offset: le::U16::new(listing.offset),
                        parent_inode: le::U32::new(parent_inode),
                    }
                    .as_bytes(),
                )?;
            } else {
                header.inode_type = basic_type.to_extended();
                im.append(header.as_bytes())?;
                im.append(
                    ExtDirInode {
                        nlink: le::U32::new(node.link_count),
                        size: le::U32::new(size as u32),
                        block_index: le::U32::new(listing.block),
                        parent_inode: le::U32::new(parent_inode),
                        index_count: le::U16::new(listing.index.len() as u16),
                        offset: le::U16::new(listing.offset),
                        xattr_idx: le::U32::new(node.xattr_idx),
                    }
                    .as_bytes(),
                )?;
                for (index, name) in &listing.index {
                    im.append(index.as_bytes())?;
                    im.append(name)?;
                }
            }
        }

        Payload::File { size, data } => {
            let fd: &FileData = &files[data
                .expect("regular files are packed before serialization")
                .index()];
            let (frag_index, frag_offset) = fd.fragment.unwrap_or((format::NO_FRAGMENT, 0));
            let sizes = fd
                .block_sizes
                .iter()
                .map(|&s| le::U32::new(s))
                .collect::<Vec<_>>();

            let fits_basic = !has_xattr
                && fd.sparse_bytes == 0
                && *size <= u64::from(u32::MAX)
                && fd.blocks_start <= u64::from(u32::MAX);
            if fits_basic {
                im.append(header.as_bytes())?;
                im.append(
                    FileInode {
                        blocks_start: le::U32::new(fd.blocks_start as u32),
                        fragment_index: le::U32::new(frag_index),
                        fragment_offset: le::U32::new(frag_offset),
                        size: le::U32::new(*size as u32),
                    }
                    .as_bytes(),
                )?;
            } else {
                header.inode_type = basic_type.to_extended();
                im.append(header.as_bytes())?;
                im.append(
                    ExtFileInode {
                        blocks_start: le::U64::new(fd.blocks_start),
                        size: le::U64::new(*size),
                        sparse: le::U64::new(fd.sparse_bytes),
                        nlink: le::U32::new(node.link_count),
                        fragment_index: le::U32::new(frag_index),
                        fragment_offset: le::U32::new(frag_offset),
                        xattr_idx: le::U32::new(node.xattr_idx),
                    }
                    .as_bytes(),
                )?;
            }
            im.append(sizes.as_slice().as_bytes())?;
        }

        Payload::Symlink(target) => {
            if has_xattr {
                header.inode_type = basic_type.to_extended();
            }
            im.append(header.as_bytes())?;
            im.append(
                SymlinkInode {
                    nlink: le::U32::new(node.link_count),
                    target_size: le::U32::new(target.len() as u32),
                }
                .as_bytes(),
            )?;
            im.append(target)?;
            if has_xattr {
                im.append(le::U32::new(node.xattr_idx).as_bytes())?;
            }
        }

        Payload::Device(devno) => {
            if has_xattr {
                header.inode_type = basic_type.to_extended();
                im.append(header.as_bytes())?;
                im.append(
                    ExtDevInode {
                        nlink: le::U32::new(node.link_count),
                        devno: le::U32::new(*devno),
                        xattr_idx: le::U32::new(node.xattr_idx),
                    }
                    .as_bytes(),
                )?;
            } else {
                im.append(header.as_bytes())?;
                im.append(
                    DevInode {
                        nlink: le::U32::new(node.link_count),
                        devno: le::U32::new(*devno),
                    }
                    .as_bytes(),
                )?;
            }
        }

        Payload::Ipc => {
            if has_xattr {
                header.inode_type = basic_type.to_extended();
                im.append(header.as_bytes())?;
                im.append(
                    ExtIpcInode {
                        nlink: le::U32::new(node.link_count),
                        xattr_idx: le::U32::new(node.xattr_idx),
                    }
                    .as_bytes(),
                )?;
            } else {
                im.append(header.as_bytes())?;
                im.append(
                    IpcInode {
                        nlink: le::U32::new(node.link_count),
                    }
                    .as_bytes(),
                )?;
            }
        }
    }
    Ok(())
}
