mod client;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, FolderEntry, FolderId, ProgressFn, padded_folder_name,
};
